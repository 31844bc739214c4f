//! Cluster teardown

use super::{KubeadmRuntime, LifecycleState};
use crate::commands;
use crate::dispatch::{fan_out, DispatchMode};
use crate::error::{ForgeError, Result};
use crate::registry;
use std::path::Path;

impl KubeadmRuntime {
    pub(crate) async fn reset_cluster(&self) -> Result<()> {
        self.require(
            "reset",
            &[
                LifecycleState::Uninitialized,
                LifecycleState::Bootstrapped,
                LifecycleState::Stable,
            ],
        )?;
        self.set_state(LifecycleState::Resetting)?;

        let master0 = self.master0()?;
        let master0_ref = master0.as_str();
        let vip = self.settings.vip.as_str();

        fan_out(&self.nodes()?, DispatchMode::BestEffort, "reset nodes", |node| async move {
            let mut cmds = self.cleanup_commands(master0_ref, false);
            cmds.push(commands::delete_route(vip, &node));
            self.remote.cmd_async(&node, &cmds).await
        })
        .await?;

        fan_out(&self.masters()?, DispatchMode::BestEffort, "reset masters", |host| async move {
            self.remote
                .cmd_async(&host, &self.cleanup_commands(master0_ref, false))
                .await
        })
        .await?;

        if let Err(e) = registry::delete(self.remote.as_ref(), &self.registry).await {
            tracing::warn!("Failed to remove registry on {}: {}", self.registry.ip, e);
        }

        tracing::info!("Cluster {} has been reset", self.cluster_snapshot()?.name());
        self.set_state(LifecycleState::Uninitialized)
    }

    /// Drop the API server entry this machine was given at setup
    pub fn remove_local_access(&self, hosts_file: &Path) -> Result<()> {
        let Ok(content) = std::fs::read_to_string(hosts_file) else {
            return Ok(());
        };
        let domain = &self.settings.apiserver_domain;
        let kept: Vec<&str> = content
            .lines()
            .filter(|l| !l.split_whitespace().skip(1).any(|name| name == domain))
            .collect();
        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        std::fs::write(hosts_file, out).map_err(|e| {
            ForgeError::Internal(format!("failed to update {}: {}", hosts_file.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::ClusterRuntime;
    use super::*;

    #[tokio::test]
    async fn test_reset_cleans_every_host() {
        let remote = fake();
        remote.fail("10.0.0.5", "kubeadm reset");
        let cluster = cluster(&["10.0.0.1", "10.0.0.2"], &["10.0.0.5", "10.0.0.6"]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);

        runtime.reset().await.unwrap();

        for host in ["10.0.0.1", "10.0.0.2", "10.0.0.5", "10.0.0.6"] {
            assert_eq!(remote.count(host, "kubeadm reset -f"), 1, "{}", host);
        }
        assert_eq!(remote.count("10.0.0.6", "seautil route del --host 10.103.97.2 --gateway 10.0.0.6"), 1);
        assert_eq!(remote.count("10.0.0.1", "docker rm -f sealer-registry"), 1);
        assert_eq!(runtime.state().unwrap(), LifecycleState::Uninitialized);

        // nodes go first
        let log = remote.all_commands();
        let last_node = log.iter().rposition(|(h, _)| h == "10.0.0.6").unwrap();
        let first_master = log.iter().position(|(h, _)| h == "10.0.0.2").unwrap();
        assert!(last_node < first_master);
    }

    #[test]
    fn test_remove_local_access() {
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, dir) = runtime(&cluster, fake(), LifecycleState::Stable);
        let hosts = dir.path().join("hosts");
        std::fs::write(
            &hosts,
            "127.0.0.1 localhost\n10.0.0.1 apiserver.cluster.local\n",
        )
        .unwrap();

        runtime.remove_local_access(&hosts).unwrap();
        assert_eq!(
            std::fs::read_to_string(&hosts).unwrap(),
            "127.0.0.1 localhost\n"
        );
    }
}
