//! Create: bootstrap a new cluster

use super::{ApplyContext, Processor};
use crate::cluster::Cluster;
use crate::error::Result;
use crate::plugin::Phase;
use crate::runtime::{ClusterRuntime, LifecycleState};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStep {
    Plugins(Phase),
    MountImage,
    DumpConfig,
    MountRootfs,
    Init,
    Join,
    Guest,
    SaveClusterfile,
    UnmountImage,
}

impl std::fmt::Display for CreateStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateStep::Plugins(phase) => write!(f, "run {} plugins", phase),
            CreateStep::MountImage => write!(f, "mount image"),
            CreateStep::DumpConfig => write!(f, "dump configs"),
            CreateStep::MountRootfs => write!(f, "mount rootfs"),
            CreateStep::Init => write!(f, "init master0"),
            CreateStep::Join => write!(f, "join masters and nodes"),
            CreateStep::Guest => write!(f, "apply guest"),
            CreateStep::SaveClusterfile => write!(f, "save Clusterfile"),
            CreateStep::UnmountImage => write!(f, "unmount image"),
        }
    }
}

pub struct CreateProcessor<'a> {
    ctx: &'a ApplyContext,
}

impl<'a> CreateProcessor<'a> {
    pub fn new(ctx: &'a ApplyContext) -> Self {
        Self { ctx }
    }

    async fn init(&self, cluster: &Cluster) -> Result<()> {
        let runtime = self.ctx.runtime(cluster, LifecycleState::Uninitialized)?;
        runtime.init().await?;
        if let Some(local) = &self.ctx.local_access {
            if let Err(e) = runtime.setup_local_access(&local.home, &local.hosts_file).await {
                tracing::warn!("Failed to set up local access to {}: {}", cluster.name(), e);
            }
        }
        Ok(())
    }

    async fn join(&self, cluster: &Cluster) -> Result<()> {
        let runtime = self.ctx.runtime(cluster, LifecycleState::Uninitialized)?;
        let masters: Vec<String> = cluster.masters().into_iter().skip(1).collect();
        runtime.join_masters(&masters).await?;
        runtime.join_nodes(&cluster.nodes()).await
    }
}

#[async_trait]
impl Processor for CreateProcessor<'_> {
    type Step = CreateStep;

    fn pipeline(&self) -> Vec<CreateStep> {
        vec![
            CreateStep::Plugins(Phase::Originally),
            CreateStep::MountImage,
            CreateStep::DumpConfig,
            CreateStep::MountRootfs,
            CreateStep::Plugins(Phase::PreInit),
            CreateStep::Init,
            CreateStep::Join,
            CreateStep::Plugins(Phase::PreGuest),
            CreateStep::Guest,
            CreateStep::SaveClusterfile,
            CreateStep::UnmountImage,
            CreateStep::Plugins(Phase::PostInstall),
        ]
    }

    async fn run(&self, step: &CreateStep, cluster: &Cluster) -> Result<()> {
        match step {
            CreateStep::Plugins(phase) => {
                self.ctx
                    .run_plugins(cluster, &cluster.all_hosts(), *phase)
                    .await
            }
            CreateStep::MountImage => self.ctx.images.mount_image(cluster),
            CreateStep::DumpConfig => self.ctx.configs.dump(cluster),
            CreateStep::MountRootfs => {
                self.ctx
                    .rootfs
                    .mount_rootfs(cluster, &cluster.all_hosts(), true)
                    .await
            }
            CreateStep::Init => self.init(cluster).await,
            CreateStep::Join => self.join(cluster).await,
            CreateStep::Guest => self.ctx.run_guest(cluster).await,
            CreateStep::SaveClusterfile => {
                let runtime = self.ctx.runtime(cluster, LifecycleState::Uninitialized)?;
                self.ctx.save_clusterfile(&runtime.observed()?)
            }
            CreateStep::UnmountImage => self.ctx.images.unmount_image(cluster),
        }
    }
}
