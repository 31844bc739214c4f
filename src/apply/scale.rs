//! Scale: join or remove hosts of a running cluster

use super::{ApplyContext, Processor};
use crate::cluster::{Cluster, ScaleDirection, ScalePlan};
use crate::error::Result;
use crate::plugin::Phase;
use crate::runtime::{ClusterRuntime, KubeadmRuntime, LifecycleState};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleStep {
    MountImage,
    MountRootfs,
    Plugins(Phase),
    JoinMasters,
    JoinNodes,
    DeleteMasters,
    DeleteNodes,
    UnmountRootfs,
    UnmountImage,
}

impl std::fmt::Display for ScaleStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaleStep::MountImage => write!(f, "mount image"),
            ScaleStep::MountRootfs => write!(f, "mount rootfs on new hosts"),
            ScaleStep::Plugins(phase) => write!(f, "run {} plugins", phase),
            ScaleStep::JoinMasters => write!(f, "join masters"),
            ScaleStep::JoinNodes => write!(f, "join nodes"),
            ScaleStep::DeleteMasters => write!(f, "delete masters"),
            ScaleStep::DeleteNodes => write!(f, "delete nodes"),
            ScaleStep::UnmountRootfs => write!(f, "unmount rootfs on removed hosts"),
            ScaleStep::UnmountImage => write!(f, "unmount image"),
        }
    }
}

/// Scale up or down, never both; the plan decides which
pub struct ScaleProcessor<'a> {
    ctx: &'a ApplyContext,
    current: Cluster,
    plan: ScalePlan,
}

impl<'a> ScaleProcessor<'a> {
    pub fn new(ctx: &'a ApplyContext, current: Cluster, plan: ScalePlan) -> Self {
        Self { ctx, current, plan }
    }

    fn runtime(&self) -> Result<Arc<KubeadmRuntime>> {
        self.ctx.runtime(&self.current, LifecycleState::Stable)
    }
}

#[async_trait]
impl Processor for ScaleProcessor<'_> {
    type Step = ScaleStep;

    fn pipeline(&self) -> Vec<ScaleStep> {
        match self.plan.direction() {
            ScaleDirection::Up => vec![
                ScaleStep::MountImage,
                ScaleStep::MountRootfs,
                ScaleStep::Plugins(Phase::PreJoin),
                ScaleStep::JoinMasters,
                ScaleStep::JoinNodes,
                ScaleStep::Plugins(Phase::PostJoin),
                ScaleStep::UnmountImage,
            ],
            ScaleDirection::Down => vec![
                ScaleStep::MountImage,
                ScaleStep::Plugins(Phase::PreClean),
                ScaleStep::DeleteMasters,
                ScaleStep::DeleteNodes,
                ScaleStep::Plugins(Phase::PostClean),
                ScaleStep::UnmountRootfs,
                ScaleStep::UnmountImage,
            ],
            ScaleDirection::None => Vec::new(),
        }
    }

    async fn run(&self, step: &ScaleStep, cluster: &Cluster) -> Result<()> {
        match step {
            ScaleStep::MountImage => self.ctx.images.mount_image(&self.current),
            ScaleStep::MountRootfs => {
                self.ctx
                    .rootfs
                    .mount_rootfs(&self.current, &self.plan.joining(), false)
                    .await
            }
            ScaleStep::Plugins(phase) => {
                let hosts = match phase {
                    Phase::PreClean | Phase::PostClean => self.plan.deleting(),
                    _ => self.plan.joining(),
                };
                self.ctx.run_plugins(cluster, &hosts, *phase).await
            }
            ScaleStep::JoinMasters => self.runtime()?.join_masters(&self.plan.join_masters).await,
            ScaleStep::JoinNodes => self.runtime()?.join_nodes(&self.plan.join_nodes).await,
            ScaleStep::DeleteMasters => {
                self.runtime()?
                    .delete_masters(&self.plan.delete_masters)
                    .await
            }
            ScaleStep::DeleteNodes => self.runtime()?.delete_nodes(&self.plan.delete_nodes).await,
            ScaleStep::UnmountRootfs => {
                self.ctx
                    .rootfs
                    .unmount_rootfs(&self.current, &self.plan.deleting())
                    .await
            }
            ScaleStep::UnmountImage => self.ctx.images.unmount_image(&self.current),
        }
    }
}
