//! Rootfs distribution over ssh

use super::{RootfsMounter, ROOTFS_MARKER};
use crate::cluster::Cluster;
use crate::commands;
use crate::dispatch::{fan_out, DispatchMode};
use crate::error::{ForgeError, Result};
use crate::paths::{self, ClusterPaths};
use crate::registry::RegistryConfig;
use crate::ssh::{wait_ssh_ready, RemoteExec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Image directory only the registry host receives
const REGISTRY_DIR: &str = "registry";

/// Docker data root handed to `init.sh`
const DOCKER_DATA_ROOT: &str = "/var/lib/docker";

/// Copies the mounted image to each host and runs its `scripts/init.sh`
pub struct SshRootfsMounter {
    remote: Arc<dyn RemoteExec>,
    data_dir: PathBuf,
    ssh_attempts: u32,
}

impl SshRootfsMounter {
    pub fn new(remote: Arc<dyn RemoteExec>, data_dir: impl Into<PathBuf>, ssh_attempts: u32) -> Self {
        Self {
            remote,
            data_dir: data_dir.into(),
            ssh_attempts,
        }
    }

    async fn mount_host(
        &self,
        host: &str,
        source: &Path,
        rootfs: &str,
        registry: &RegistryConfig,
        env: &[String],
    ) -> Result<()> {
        let marker = format!("{}/{}", rootfs, ROOTFS_MARKER);
        if self.remote.is_file_exist(host, &marker).await? {
            tracing::debug!("Rootfs already mounted on {}", host);
            return Ok(());
        }

        let entries = std::fs::read_dir(source)
            .map_err(|e| ForgeError::Mount(format!("failed to read {}: {}", source.display(), e)))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == REGISTRY_DIR && host != registry.ip {
                continue;
            }
            self.remote
                .copy(host, &entry.path(), &format!("{}/{}", rootfs, name))
                .await?;
        }

        let init = format!(
            "cd {rootfs} && chmod +x scripts/* && cd scripts && bash init.sh {} {} {} && touch {marker}",
            DOCKER_DATA_ROOT,
            registry.domain,
            registry.port,
            rootfs = rootfs,
            marker = marker
        );
        self.remote.cmd(host, &commands::with_env(env, &init)).await?;
        tracing::info!("Mounted rootfs on {}", host);
        Ok(())
    }
}

#[async_trait]
impl RootfsMounter for SshRootfsMounter {
    async fn mount_rootfs(&self, cluster: &Cluster, hosts: &[String], initial: bool) -> Result<()> {
        let cluster_paths = ClusterPaths::new(&self.data_dir, cluster.name());
        let source = cluster_paths.mount();
        let registry = RegistryConfig::resolve(&source, &cluster.master0()?)?;

        let mut targets = hosts.to_vec();
        if initial && !targets.contains(&registry.ip) {
            targets.push(registry.ip.clone());
        }
        wait_ssh_ready(self.remote.as_ref(), &targets, self.ssh_attempts).await?;

        let rootfs = paths::remote_rootfs(cluster.name());
        let (source_ref, rootfs_ref, registry_ref) = (source.as_path(), rootfs.as_str(), &registry);
        fan_out(&targets, DispatchMode::FailFast, "mount rootfs", |host| async move {
            let env = cluster.env_for(&host);
            self.mount_host(&host, source_ref, rootfs_ref, registry_ref, &env)
                .await
        })
        .await
    }

    async fn unmount_rootfs(&self, cluster: &Cluster, hosts: &[String]) -> Result<()> {
        let rootfs = paths::remote_rootfs(cluster.name());
        let rootfs_ref = rootfs.as_str();
        fan_out(hosts, DispatchMode::FailFast, "unmount rootfs", |host| async move {
            self.remote
                .cmd_async(
                    &host,
                    &[
                        commands::run_clean_script(rootfs_ref),
                        format!("rm -rf {}", rootfs_ref),
                    ],
                )
                .await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Host, Role};
    use crate::ssh::fake::FakeRemote;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Cluster) {
        let dir = TempDir::new().unwrap();
        let mount = dir.path().join("c1/mount");
        std::fs::create_dir_all(mount.join("scripts")).unwrap();
        std::fs::create_dir_all(mount.join("registry")).unwrap();
        std::fs::write(mount.join("scripts/init.sh"), "#!/bin/bash").unwrap();

        let mut cluster = Cluster::new("c1", "kubernetes:v1.19.8");
        cluster.spec.hosts.push(Host {
            ips: vec!["10.0.0.1".to_string()],
            roles: vec![Role::Master],
            ..Default::default()
        });
        (dir, cluster)
    }

    #[tokio::test]
    async fn test_registry_dir_only_on_registry_host() {
        let (dir, cluster) = setup();
        let remote = Arc::new(FakeRemote::new());
        let mounter = SshRootfsMounter::new(remote.clone(), dir.path(), 1);

        mounter
            .mount_rootfs(&cluster, &["10.0.0.1".to_string(), "10.0.0.5".to_string()], true)
            .await
            .unwrap();

        let rootfs = paths::remote_rootfs("c1");
        let registry_copy = format!("{}/registry", rootfs);
        assert!(remote.copies("10.0.0.1").iter().any(|(_, r)| r == &registry_copy));
        assert!(!remote.copies("10.0.0.5").iter().any(|(_, r)| r == &registry_copy));
        assert_eq!(remote.count("10.0.0.5", "bash init.sh /var/lib/docker sea.hub 5000"), 1);
    }

    #[tokio::test]
    async fn test_init_gets_host_env() {
        let (dir, mut cluster) = setup();
        cluster.spec.env = vec!["DOCKER_VERSION=19.03".to_string()];
        cluster.spec.hosts[0].env = vec!["ROLE=master".to_string()];
        let remote = Arc::new(FakeRemote::new());
        let mounter = SshRootfsMounter::new(remote.clone(), dir.path(), 1);

        mounter
            .mount_rootfs(&cluster, &["10.0.0.1".to_string()], false)
            .await
            .unwrap();
        let init = remote
            .commands("10.0.0.1")
            .into_iter()
            .find(|c| c.contains("bash init.sh"))
            .unwrap();
        assert!(init.starts_with("export DOCKER_VERSION='19.03' ROLE='master' && cd "));
    }

    #[tokio::test]
    async fn test_mount_is_idempotent() {
        let (dir, cluster) = setup();
        let remote = Arc::new(FakeRemote::new());
        remote.creates("bash init.sh", &format!("{}/.mounted", paths::remote_rootfs("c1")));
        let mounter = SshRootfsMounter::new(remote.clone(), dir.path(), 1);
        let hosts = vec!["10.0.0.5".to_string()];

        mounter.mount_rootfs(&cluster, &hosts, false).await.unwrap();
        mounter.mount_rootfs(&cluster, &hosts, false).await.unwrap();
        assert_eq!(remote.count("10.0.0.5", "bash init.sh"), 1);
        assert!(remote.copies("10.0.0.1").is_empty());
    }

    #[tokio::test]
    async fn test_unmount_runs_clean_script() {
        let (dir, cluster) = setup();
        let remote = Arc::new(FakeRemote::new());
        let mounter = SshRootfsMounter::new(remote.clone(), dir.path(), 1);

        mounter
            .unmount_rootfs(&cluster, &["10.0.0.5".to_string()])
            .await
            .unwrap();
        let cmds = remote.commands("10.0.0.5");
        assert!(cmds[0].contains("clean.sh"));
        assert_eq!(cmds[1], "rm -rf /var/lib/clusterforge/c1/rootfs");
    }
}
