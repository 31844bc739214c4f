//! SSH client built on the system `ssh` and `scp` binaries

use super::RemoteExec;
use crate::cluster::{Cluster, SshCredentials};
use crate::error::{ForgeError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Upper bound for a single remote command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Upper bound for a liveness probe
const PING_TIMEOUT: Duration = Duration::from_secs(15);

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "ConnectTimeout=10",
];

/// SSH client with per-host credentials
#[derive(Debug, Clone, Default)]
pub struct SshClient {
    /// Credentials used when a host has no override
    default: SshCredentials,
    /// Per-host credentials, already merged with the default
    hosts: HashMap<String, SshCredentials>,
}

impl SshClient {
    pub fn new(default: SshCredentials) -> Self {
        Self {
            default,
            hosts: HashMap::new(),
        }
    }

    /// Client for every host of a cluster
    pub fn from_cluster(cluster: &Cluster) -> Self {
        let mut client = Self::new(cluster.spec.ssh.clone());
        for ip in cluster.all_hosts() {
            client.hosts.insert(ip.clone(), cluster.ssh_for(&ip));
        }
        client
    }

    fn credentials(&self, host: &str) -> &SshCredentials {
        self.hosts.get(host).unwrap_or(&self.default)
    }

    /// `ssh` or `scp`, wrapped in sshpass when a password is configured
    fn base_command(&self, program: &str, host: &str) -> Command {
        let creds = self.credentials(host);
        let mut cmd = match &creds.passwd {
            Some(passwd) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(passwd).arg(program);
                cmd
            }
            None => Command::new(program),
        };
        cmd.args(SSH_OPTIONS);
        if let Some(pk) = &creds.pk {
            if creds.pk_passwd.is_some() {
                tracing::debug!(host = %host, "private key passphrase must be provided by ssh-agent");
            }
            cmd.arg("-i").arg(pk);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn ssh(&self, host: &str, command: &str) -> Command {
        let creds = self.credentials(host);
        let mut cmd = self.base_command("ssh", host);
        cmd.arg("-p")
            .arg(creds.port().to_string())
            .arg(format!("{}@{}", creds.user(), host))
            .arg(command);
        cmd
    }

    fn scp(&self, host: &str) -> Command {
        let creds = self.credentials(host);
        let mut cmd = self.base_command("scp", host);
        cmd.arg("-r").arg("-P").arg(creds.port().to_string());
        cmd
    }

    fn target(&self, host: &str, path: &str) -> String {
        format!("{}@{}:{}", self.credentials(host).user(), host, path)
    }
}

async fn run(
    mut cmd: Command,
    timeout: Duration,
    host: &str,
    description: &str,
) -> std::result::Result<String, String> {
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| format!("timed out after {:?}", timeout))?
        .map_err(|e| format!("failed to execute: {}", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        tracing::debug!(host = %host, "{} succeeded", description);
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "{}: {}{}",
            output.status,
            stderr.trim(),
            if stdout.trim().is_empty() {
                String::new()
            } else {
                format!(" (stdout: {})", stdout.trim())
            }
        ))
    }
}

#[async_trait]
impl RemoteExec for SshClient {
    async fn cmd(&self, host: &str, command: &str) -> Result<String> {
        tracing::debug!(host = %host, "exec: {}", command);
        run(self.ssh(host, command), COMMAND_TIMEOUT, host, command)
            .await
            .map_err(|message| ForgeError::remote(host, command, message))
    }

    async fn copy(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        let parent = Path::new(remote)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        self.cmd(host, &format!("mkdir -p {}", parent)).await?;

        tracing::debug!(host = %host, "copy {} -> {}", local.display(), remote);
        let mut cmd = self.scp(host);
        cmd.arg(local).arg(self.target(host, remote));
        run(cmd, COMMAND_TIMEOUT, host, "scp")
            .await
            .map(|_| ())
            .map_err(|message| ForgeError::Copy {
                host: host.to_string(),
                src: local.display().to_string(),
                dst: remote.to_string(),
                message,
            })
    }

    async fn fetch(&self, host: &str, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cmd = self.scp(host);
        cmd.arg(self.target(host, remote)).arg(local);
        run(cmd, COMMAND_TIMEOUT, host, "scp")
            .await
            .map(|_| ())
            .map_err(|message| ForgeError::Copy {
                host: host.to_string(),
                src: remote.to_string(),
                dst: local.display().to_string(),
                message,
            })
    }

    async fn ping(&self, host: &str) -> Result<()> {
        run(self.ssh(host, "true"), PING_TIMEOUT, host, "ping")
            .await
            .map(|_| ())
            .map_err(|message| ForgeError::remote(host, "true", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Host, Role};

    #[test]
    fn test_host_credentials_merge() {
        let mut cluster = Cluster::new("c", "img");
        cluster.spec.ssh = SshCredentials {
            user: Some("ops".to_string()),
            passwd: Some("pw".to_string()),
            ..Default::default()
        };
        cluster.spec.hosts = vec![Host {
            ips: vec!["10.0.0.1".to_string()],
            roles: vec![Role::Master],
            ssh: Some(SshCredentials {
                port: Some(2200),
                ..Default::default()
            }),
            ..Default::default()
        }];

        let client = SshClient::from_cluster(&cluster);
        let creds = client.credentials("10.0.0.1");
        assert_eq!(creds.user(), "ops");
        assert_eq!(creds.port(), 2200);
        assert_eq!(client.credentials("10.9.9.9").port(), 22);
        assert_eq!(client.target("10.0.0.1", "/tmp/x"), "ops@10.0.0.1:/tmp/x");
    }
}
