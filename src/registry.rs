//! Internal image registry
//!
//! Resolves where the bootstrap registry lives and brings it up. The
//! location defaults to Master0 on `sea.hub:5000`; an override file in the
//! cluster image may replace any field.

use crate::commands;
use crate::error::{ForgeError, Result};
use crate::ssh::RemoteExec;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default registry domain
pub const DEFAULT_DOMAIN: &str = "sea.hub";

/// Alias every host resolves to the registry as well
pub const SEA_HUB: &str = "sea.hub";

/// Default registry port
pub const DEFAULT_PORT: u16 = 5000;

/// Override file, relative to the mounted image
pub const OVERRIDE_FILE: &str = "etc/registry_config.yml";

/// Container `scripts/init-registry.sh` in a cluster image starts the
/// registry as; bring-up and teardown both look for it by this name
pub const CONTAINER_NAME: &str = "sealer-registry";

/// Resolved registry location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Host running the registry
    pub ip: String,
    /// Domain images are pulled from
    pub domain: String,
    /// Listen port
    pub port: u16,
    /// Optional basic-auth user
    pub username: Option<String>,
    /// Optional basic-auth password
    pub password: Option<String>,
}

/// On-disk override; empty or missing fields fall back to defaults
#[derive(Debug, Default, Deserialize)]
struct RegistryOverride {
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    port: Option<serde_yaml::Value>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl RegistryConfig {
    /// Defaults for a cluster anchored at `master0`
    pub fn defaults(master0: &str) -> Self {
        Self {
            ip: master0.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
        }
    }

    /// Resolve from the override file under `image_root`, if any
    pub fn resolve(image_root: &Path, master0: &str) -> Result<Self> {
        let mut config = Self::defaults(master0);
        let path = image_root.join(OVERRIDE_FILE);
        if !path.exists() {
            tracing::debug!("No registry override at {}, using defaults", path.display());
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path)?;
        let over: RegistryOverride = if content.trim().is_empty() {
            RegistryOverride::default()
        } else {
            serde_yaml::from_str(&content).map_err(|e| {
                ForgeError::Registry(format!("invalid {}: {}", path.display(), e))
            })?
        };

        if let Some(ip) = non_empty(over.ip) {
            config.ip = ip;
        }
        if let Some(domain) = non_empty(over.domain) {
            config.domain = domain;
        }
        if let Some(port) = over.port {
            config.port = parse_port(&port)?;
        }
        config.username = non_empty(over.username);
        config.password = non_empty(over.password);
        Ok(config)
    }

    /// `domain:port`
    pub fn repo(&self) -> String {
        format!("{}:{}", self.domain, self.port)
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    /// htpasswd line for the configured credentials
    pub fn htpasswd(&self) -> Result<Option<String>> {
        let Some((user, password)) = self.credentials() else {
            return Ok(None);
        };
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| ForgeError::Registry(format!("failed to hash password: {}", e)))?;
        Ok(Some(format!("{}:{}", user, hash)))
    }

    /// Hosts entries every cluster member needs to reach the registry
    pub fn host_entries(&self) -> Vec<String> {
        let mut cmds = vec![commands::add_etc_hosts(&self.ip, &self.domain)];
        if self.domain != SEA_HUB {
            cmds.push(commands::add_etc_hosts(&self.ip, SEA_HUB));
        }
        cmds
    }

    /// Docker login plus kubelet credential copy, when credentials are set
    pub fn login_command(&self) -> Option<String> {
        self.credentials().map(|(user, password)| {
            format!(
                "docker login {} -u {} -p {} && cp /root/.docker/config.json /var/lib/kubelet && systemctl restart kubelet",
                self.repo(),
                user,
                password
            )
        })
    }

    /// Remote directory docker reads this registry's CA from
    pub fn docker_cert_dir(&self) -> String {
        format!("{}/{}", commands::DOCKER_CERT_DIR, self.repo())
    }
}

fn parse_port(value: &serde_yaml::Value) -> Result<u16> {
    match value {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| ForgeError::Registry(format!("invalid registry port: {}", n))),
        serde_yaml::Value::String(s) if s.trim().is_empty() => Ok(DEFAULT_PORT),
        serde_yaml::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ForgeError::Registry(format!("invalid registry port: {}", s))),
        serde_yaml::Value::Null => Ok(DEFAULT_PORT),
        other => Err(ForgeError::Registry(format!(
            "invalid registry port: {:?}",
            other
        ))),
    }
}

/// Bring the registry up on its host and make Master0 able to use it
pub async fn apply(
    remote: &dyn RemoteExec,
    config: &RegistryConfig,
    rootfs: &str,
    master0: &str,
) -> Result<()> {
    let running = remote
        .cmd(
            &config.ip,
            &format!("docker ps -q -f name=^{}$ 2>/dev/null || true", CONTAINER_NAME),
        )
        .await?;

    if running.trim().is_empty() {
        if let Some(line) = config.htpasswd()? {
            remote
                .cmd(
                    &config.ip,
                    &format!("echo '{}' > {}/etc/registry_htpasswd", line, rootfs),
                )
                .await?;
        }
        remote
            .cmd(
                &config.ip,
                &format!(
                    "cd {rootfs}/scripts && sh init-registry.sh {} {rootfs}/registry {}",
                    config.port,
                    config.domain,
                    rootfs = rootfs
                ),
            )
            .await?;
        tracing::info!("Registry {} started on {}", config.repo(), config.ip);
    } else {
        tracing::info!("Registry already running on {}", config.ip);
    }

    let mut cmds = config.host_entries();
    cmds.push(commands::register_clean(
        rootfs,
        &commands::remove_etc_hosts(&config.domain),
    ));
    if let Some(login) = config.login_command() {
        cmds.push(login);
    }
    remote.cmd_async(master0, &cmds).await
}

/// Force-remove the registry container if present
pub async fn delete(remote: &dyn RemoteExec, config: &RegistryConfig) -> Result<()> {
    remote
        .cmd(
            &config.ip,
            &format!(
                "if docker inspect {name} > /dev/null 2>&1; then docker rm -f {name}; fi",
                name = CONTAINER_NAME
            ),
        )
        .await?;
    Ok(())
}
