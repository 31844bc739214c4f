//! Install and uninstall application images on a running cluster
//!
//! An application image carries workloads only. Its content is synced into
//! the rootfs on Master0 and its `guest.sh` applied there; no host is
//! initialized or joined.

use super::{ApplyContext, Processor};
use crate::cluster::Cluster;
use crate::error::{ForgeError, Result};
use crate::plugin::Phase;
use async_trait::async_trait;

/// Image directory kept out of the application sync
const REGISTRY_DIR: &str = "registry";

/// Removal script an application image may ship
const UNINSTALL_SCRIPT: &str = "uninstall.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    Plugins(Phase),
    MountImage,
    DumpConfig,
    SyncRootfs,
    Guest,
    UnmountImage,
}

impl std::fmt::Display for InstallStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallStep::Plugins(phase) => write!(f, "run {} plugins", phase),
            InstallStep::MountImage => write!(f, "mount image"),
            InstallStep::DumpConfig => write!(f, "dump configs"),
            InstallStep::SyncRootfs => write!(f, "sync rootfs to master0"),
            InstallStep::Guest => write!(f, "apply guest"),
            InstallStep::UnmountImage => write!(f, "unmount image"),
        }
    }
}

pub struct InstallProcessor<'a> {
    ctx: &'a ApplyContext,
}

impl<'a> InstallProcessor<'a> {
    pub fn new(ctx: &'a ApplyContext) -> Self {
        Self { ctx }
    }

    async fn sync_rootfs(&self, cluster: &Cluster) -> Result<()> {
        let master0 = cluster.master0()?;
        let source = self.ctx.paths(cluster).mount();
        let rootfs = self.ctx.remote_rootfs(cluster);
        let entries = std::fs::read_dir(&source)
            .map_err(|e| ForgeError::Mount(format!("failed to read {}: {}", source.display(), e)))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == REGISTRY_DIR {
                continue;
            }
            self.ctx
                .remote
                .copy(&master0, &entry.path(), &format!("{}/{}", rootfs, name))
                .await?;
        }
        tracing::info!("Synced {} to {}", cluster.image(), master0);
        Ok(())
    }
}

#[async_trait]
impl Processor for InstallProcessor<'_> {
    type Step = InstallStep;

    fn pipeline(&self) -> Vec<InstallStep> {
        vec![
            InstallStep::MountImage,
            InstallStep::DumpConfig,
            InstallStep::SyncRootfs,
            InstallStep::Plugins(Phase::PreGuest),
            InstallStep::Guest,
            InstallStep::UnmountImage,
            InstallStep::Plugins(Phase::PostInstall),
        ]
    }

    async fn run(&self, step: &InstallStep, cluster: &Cluster) -> Result<()> {
        match step {
            InstallStep::Plugins(phase) => {
                self.ctx
                    .run_plugins(cluster, &cluster.all_hosts(), *phase)
                    .await
            }
            InstallStep::MountImage => self.ctx.images.mount_image(cluster),
            InstallStep::DumpConfig => self.ctx.configs.dump(cluster),
            InstallStep::SyncRootfs => self.sync_rootfs(cluster).await,
            InstallStep::Guest => self.ctx.run_guest(cluster).await,
            InstallStep::UnmountImage => self.ctx.images.unmount_image(cluster),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallStep {
    Plugins(Phase),
    MountImage,
    Uninstall,
    UnmountImage,
}

impl std::fmt::Display for UninstallStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UninstallStep::Plugins(phase) => write!(f, "run {} plugins", phase),
            UninstallStep::MountImage => write!(f, "mount image"),
            UninstallStep::Uninstall => write!(f, "uninstall workloads"),
            UninstallStep::UnmountImage => write!(f, "unmount image"),
        }
    }
}

pub struct UninstallProcessor<'a> {
    ctx: &'a ApplyContext,
}

impl<'a> UninstallProcessor<'a> {
    pub fn new(ctx: &'a ApplyContext) -> Self {
        Self { ctx }
    }

    async fn uninstall(&self, cluster: &Cluster) -> Result<()> {
        let script = self.ctx.paths(cluster).mount().join(UNINSTALL_SCRIPT);
        if !script.exists() {
            tracing::info!("Image {} has no {}, nothing to remove", cluster.image(), UNINSTALL_SCRIPT);
            return Ok(());
        }
        let master0 = cluster.master0()?;
        let rootfs = self.ctx.remote_rootfs(cluster);
        self.ctx
            .remote
            .copy(&master0, &script, &format!("{}/{}", rootfs, UNINSTALL_SCRIPT))
            .await?;
        self.ctx
            .remote
            .cmd(&master0, &format!("cd {} && bash {}", rootfs, UNINSTALL_SCRIPT))
            .await?;
        tracing::info!("Uninstalled {}", cluster.image());
        Ok(())
    }
}

#[async_trait]
impl Processor for UninstallProcessor<'_> {
    type Step = UninstallStep;

    fn pipeline(&self) -> Vec<UninstallStep> {
        vec![
            UninstallStep::Plugins(Phase::PreClean),
            UninstallStep::MountImage,
            UninstallStep::Uninstall,
            UninstallStep::UnmountImage,
            UninstallStep::Plugins(Phase::PostClean),
        ]
    }

    async fn run(&self, step: &UninstallStep, cluster: &Cluster) -> Result<()> {
        match step {
            UninstallStep::Plugins(phase) => {
                self.ctx
                    .run_plugins(cluster, &cluster.all_hosts(), *phase)
                    .await
            }
            UninstallStep::MountImage => self.ctx.images.mount_image(cluster),
            UninstallStep::Uninstall => self.uninstall(cluster).await,
            UninstallStep::UnmountImage => self.ctx.images.unmount_image(cluster),
        }
    }
}
