//! Delete: tear down a whole cluster

use super::{ApplyContext, Processor};
use crate::cluster::Cluster;
use crate::error::Result;
use crate::plugin::Phase;
use crate::runtime::{ClusterRuntime, LifecycleState};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStep {
    Plugins(Phase),
    MountImage,
    Reset,
    UnmountRootfs,
    UnmountImage,
    CleanLocal,
}

impl std::fmt::Display for DeleteStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeleteStep::Plugins(phase) => write!(f, "run {} plugins", phase),
            DeleteStep::MountImage => write!(f, "mount image"),
            DeleteStep::Reset => write!(f, "reset cluster"),
            DeleteStep::UnmountRootfs => write!(f, "unmount rootfs"),
            DeleteStep::UnmountImage => write!(f, "unmount image"),
            DeleteStep::CleanLocal => write!(f, "clean local files"),
        }
    }
}

pub struct DeleteProcessor<'a> {
    ctx: &'a ApplyContext,
}

impl<'a> DeleteProcessor<'a> {
    pub fn new(ctx: &'a ApplyContext) -> Self {
        Self { ctx }
    }

    async fn reset(&self, cluster: &Cluster) -> Result<()> {
        let runtime = self.ctx.runtime(cluster, LifecycleState::Stable)?;
        runtime.reset().await?;
        if let Some(local) = &self.ctx.local_access {
            if let Err(e) = runtime.remove_local_access(&local.hosts_file) {
                tracing::warn!("Failed to remove local access to {}: {}", cluster.name(), e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for DeleteProcessor<'_> {
    type Step = DeleteStep;

    fn pipeline(&self) -> Vec<DeleteStep> {
        vec![
            DeleteStep::Plugins(Phase::PreClean),
            DeleteStep::MountImage,
            DeleteStep::Reset,
            DeleteStep::Plugins(Phase::PostClean),
            DeleteStep::UnmountRootfs,
            DeleteStep::UnmountImage,
            DeleteStep::CleanLocal,
        ]
    }

    async fn run(&self, step: &DeleteStep, cluster: &Cluster) -> Result<()> {
        match step {
            DeleteStep::Plugins(phase) => {
                self.ctx
                    .run_plugins(cluster, &cluster.all_hosts(), *phase)
                    .await
            }
            DeleteStep::MountImage => self.ctx.images.mount_image(cluster),
            DeleteStep::Reset => self.reset(cluster).await,
            DeleteStep::UnmountRootfs => {
                self.ctx
                    .rootfs
                    .unmount_rootfs(cluster, &cluster.all_hosts())
                    .await
            }
            DeleteStep::UnmountImage => self.ctx.images.unmount_image(cluster),
            DeleteStep::CleanLocal => self.ctx.images.clean(cluster),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::context::testutil::*;
    use super::super::{CreateProcessor, Executor};
    use super::*;
    use crate::cluster::{Host, Role};

    fn cluster() -> Cluster {
        let mut cluster = Cluster::new(CLUSTER, IMAGE);
        cluster.spec.hosts.push(Host {
            ips: vec!["10.0.0.1".to_string()],
            roles: vec![Role::Master],
            ..Default::default()
        });
        cluster.spec.hosts.push(Host {
            ips: vec!["10.0.0.5".to_string()],
            roles: vec![Role::Node],
            ..Default::default()
        });
        cluster
    }

    #[tokio::test]
    async fn test_delete_tears_down_everything() {
        let (ctx, remote, dir) = context();
        remote.set_hostname("10.0.0.1", "master-0");
        let cluster = cluster();
        Executor::new(CreateProcessor::new(&ctx))
            .execute(&cluster)
            .await
            .unwrap();
        assert!(dir.path().join("c1/Clusterfile").exists());

        let again = context_in(&dir, remote.clone());
        Executor::new(DeleteProcessor::new(&again))
            .execute(&cluster)
            .await
            .unwrap();

        for host in ["10.0.0.1", "10.0.0.5"] {
            assert_eq!(remote.count(host, "kubeadm reset -f"), 1);
            assert_eq!(remote.count(host, "rm -rf /var/lib/clusterforge/c1/rootfs"), 1);
        }
        assert!(!dir.path().join("c1").exists());
        // the image store itself survives
        assert!(dir.path().join("images").exists());
    }

    #[tokio::test]
    async fn test_delete_tolerates_failing_node() {
        let (ctx, remote, dir) = context();
        remote.fail("10.0.0.5", "kubeadm reset");
        let cluster = cluster();

        Executor::new(DeleteProcessor::new(&ctx))
            .execute(&cluster)
            .await
            .unwrap();
        assert_eq!(remote.count("10.0.0.1", "kubeadm reset -f"), 1);
        assert!(!dir.path().join("c1").exists());
    }
}
