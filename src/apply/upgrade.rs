//! Upgrade: move a running cluster to a new image

use super::{ApplyContext, Processor};
use crate::cluster::Cluster;
use crate::dispatch::{fan_out, DispatchMode};
use crate::error::Result;
use crate::filesystem::ROOTFS_MARKER;
use crate::runtime::{ClusterRuntime, LifecycleState};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStep {
    MountImage,
    MountRootfs,
    Upgrade,
    SaveClusterfile,
    UnmountImage,
}

impl std::fmt::Display for UpgradeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeStep::MountImage => write!(f, "mount image"),
            UpgradeStep::MountRootfs => write!(f, "refresh rootfs"),
            UpgradeStep::Upgrade => write!(f, "upgrade kubernetes"),
            UpgradeStep::SaveClusterfile => write!(f, "save Clusterfile"),
            UpgradeStep::UnmountImage => write!(f, "unmount image"),
        }
    }
}

/// Runs against a descriptor already carrying the new image
pub struct UpgradeProcessor<'a> {
    ctx: &'a ApplyContext,
}

impl<'a> UpgradeProcessor<'a> {
    pub fn new(ctx: &'a ApplyContext) -> Self {
        Self { ctx }
    }

    /// Push the new image over the old rootfs on every host
    async fn refresh_rootfs(&self, cluster: &Cluster) -> Result<()> {
        let hosts = cluster.all_hosts();
        let marker = format!("{}/{}", self.ctx.remote_rootfs(cluster), ROOTFS_MARKER);
        let marker_ref = marker.as_str();
        fan_out(&hosts, DispatchMode::FailFast, "clear rootfs marker", |host| async move {
            self.ctx
                .remote
                .cmd(&host, &format!("rm -f {}", marker_ref))
                .await
                .map(|_| ())
        })
        .await?;
        self.ctx.rootfs.mount_rootfs(cluster, &hosts, false).await
    }
}

#[async_trait]
impl Processor for UpgradeProcessor<'_> {
    type Step = UpgradeStep;

    fn pipeline(&self) -> Vec<UpgradeStep> {
        vec![
            UpgradeStep::MountImage,
            UpgradeStep::MountRootfs,
            UpgradeStep::Upgrade,
            UpgradeStep::SaveClusterfile,
            UpgradeStep::UnmountImage,
        ]
    }

    async fn run(&self, step: &UpgradeStep, cluster: &Cluster) -> Result<()> {
        match step {
            UpgradeStep::MountImage => self.ctx.images.mount_image(cluster),
            UpgradeStep::MountRootfs => self.refresh_rootfs(cluster).await,
            UpgradeStep::Upgrade => {
                self.ctx
                    .runtime(cluster, LifecycleState::Stable)?
                    .upgrade()
                    .await
            }
            UpgradeStep::SaveClusterfile => self.ctx.save_clusterfile(cluster),
            UpgradeStep::UnmountImage => self.ctx.images.unmount_image(cluster),
        }
    }
}
