//! Built-in plugins: `SHELL` scripts and `LABEL` node labels

use super::{Phase, PluginRunner};
use crate::cluster::{Cluster, Clusterfile, PluginSpec};
use crate::commands;
use crate::dispatch::{fan_out, DispatchMode};
use crate::error::{ForgeError, Result};
use crate::ssh::RemoteExec;
use async_trait::async_trait;
use std::sync::Arc;

const SHELL: &str = "SHELL";
const LABEL: &str = "LABEL";

/// Plugins loaded from a Clusterfile
pub struct ShellPlugins {
    remote: Arc<dyn RemoteExec>,
    plugins: Vec<PluginSpec>,
}

impl ShellPlugins {
    pub fn new(remote: Arc<dyn RemoteExec>, plugins: Vec<PluginSpec>) -> Self {
        Self { remote, plugins }
    }

    /// Plugins declared in the Clusterfile the descriptor was loaded from
    pub fn from_cluster(remote: Arc<dyn RemoteExec>, cluster: &Cluster) -> Result<Self> {
        let plugins = Clusterfile::from_cluster(cluster)?.plugins;
        tracing::debug!("Loaded {} plugin(s) for {}", plugins.len(), cluster.name());
        Ok(Self::new(remote, plugins))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    async fn run_shell(&self, cluster: &Cluster, plugin: &PluginSpec, targets: &[String]) -> Result<()> {
        let script = plugin.data.trim();
        if script.is_empty() {
            return Ok(());
        }
        fan_out(targets, DispatchMode::FailFast, "shell plugin", |host| async move {
            let command = commands::with_env(&cluster.env_for(&host), script);
            self.remote.cmd(&host, &command).await.map(|_| ())
        })
        .await
    }

    /// Each data line is `<ip> key=value[,key=value...]`
    async fn run_label(&self, cluster: &Cluster, plugin: &PluginSpec, targets: &[String]) -> Result<()> {
        let master0 = cluster.master0()?;
        for line in plugin.data.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (ip, labels) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| ForgeError::Plugin(format!("invalid label line {:?}", line)))?;
            if !targets.iter().any(|t| t == ip) {
                continue;
            }
            let node = self.remote.hostname(ip).await?.to_lowercase();
            let labels: Vec<&str> = labels.split(',').map(str::trim).filter(|l| !l.is_empty()).collect();
            self.remote
                .cmd(
                    &master0,
                    &format!("kubectl label node {} {} --overwrite", node, labels.join(" ")),
                )
                .await?;
        }
        Ok(())
    }
}

/// Hosts selected by a plugin's `on` field
pub fn select_hosts(cluster: &Cluster, on: Option<&str>, hosts: &[String]) -> Vec<String> {
    let Some(on) = on.map(str::trim).filter(|o| !o.is_empty()) else {
        return hosts.to_vec();
    };
    let allowed: Vec<String> = match on.strip_prefix("role=").unwrap_or(on) {
        "master" => cluster.masters(),
        "node" => cluster.nodes(),
        _ if on.starts_with("role=") => Vec::new(),
        ips => ips.split(',').map(|s| s.trim().to_string()).collect(),
    };
    hosts
        .iter()
        .filter(|h| allowed.contains(h))
        .cloned()
        .collect()
}

#[async_trait]
impl PluginRunner for ShellPlugins {
    async fn run(&self, cluster: &Cluster, hosts: &[String], phase: Phase) -> Result<()> {
        for plugin in &self.plugins {
            if plugin.action.parse::<Phase>()? != phase {
                continue;
            }
            let targets = select_hosts(cluster, plugin.on.as_deref(), hosts);
            if targets.is_empty() {
                continue;
            }
            tracing::info!("Running {} plugin {} on {} host(s)", phase, plugin.name, targets.len());
            match plugin.name.to_uppercase().as_str() {
                SHELL => self.run_shell(cluster, plugin, &targets).await?,
                LABEL => self.run_label(cluster, plugin, &targets).await?,
                other => {
                    return Err(ForgeError::Plugin(format!("unknown plugin {}", other)));
                }
            }
        }
        Ok(())
    }
}
