//! Remote execution
//!
//! Every remote action goes through [`RemoteExec`]. The production client
//! drives the system `ssh` and `scp` binaries; tests use a recording fake.

pub mod client;
#[cfg(test)]
pub mod fake;

pub use client::SshClient;

use crate::dispatch::{fan_out, DispatchMode};
use crate::error::{ForgeError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Default number of liveness probes per host
pub const DEFAULT_SSH_ATTEMPTS: u32 = 6;

/// Shell session to a set of hosts
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run a command and return its standard output
    async fn cmd(&self, host: &str, command: &str) -> Result<String>;

    /// Run commands in order, stopping at the first failure
    async fn cmd_async(&self, host: &str, commands: &[String]) -> Result<()> {
        for command in commands {
            self.cmd(host, command).await?;
        }
        Ok(())
    }

    /// Copy a local file or directory to the host
    async fn copy(&self, host: &str, local: &Path, remote: &str) -> Result<()>;

    /// Copy a remote file to the local machine
    async fn fetch(&self, host: &str, remote: &str, local: &Path) -> Result<()>;

    /// Check the host answers
    async fn ping(&self, host: &str) -> Result<()>;

    async fn is_file_exist(&self, host: &str, path: &str) -> Result<bool> {
        let out = self
            .cmd(host, &format!("if [ -e {} ]; then echo yes; else echo no; fi", path))
            .await?;
        Ok(out.trim() == "yes")
    }

    /// Remote hostname
    async fn hostname(&self, host: &str) -> Result<String> {
        Ok(self.cmd(host, "hostname").await?.trim().to_string())
    }
}

/// Wait until every host answers, probing each up to `attempts` times.
/// Attempt `i` is followed by an `i` second pause.
pub async fn wait_ssh_ready(remote: &dyn RemoteExec, hosts: &[String], attempts: u32) -> Result<()> {
    fan_out(hosts, DispatchMode::FailFast, "wait for ssh", |host| async move {
        let mut last_error = None;
        for attempt in 1..=attempts {
            match remote.ping(&host).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(host = %host, attempt = attempt, error = %e, "ssh not ready");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }
        if let Some(e) = last_error {
            tracing::warn!(host = %host, "giving up on ssh: {}", e);
        }
        Err(ForgeError::SshUnreachable {
            host,
            attempts,
        })
    })
    .await
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRemote;
    use super::*;

    #[tokio::test]
    async fn test_wait_ssh_ready() {
        let remote = FakeRemote::new();
        let hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        wait_ssh_ready(&remote, &hosts, 3).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_ssh_ready_unreachable() {
        let remote = FakeRemote::new();
        remote.set_unreachable("10.0.0.2");
        let hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];

        let err = wait_ssh_ready(&remote, &hosts, 1).await.unwrap_err();
        match err {
            ForgeError::Fanout { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].host, "10.0.0.2");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
