//! Generate: adopt a cluster that is already running
//!
//! The descriptor is saved as current state first, then the hosts get the
//! rootfs and registry a created cluster would have. Certificates and
//! kubeconfigs are pulled back from Master0 so later joins can reuse them.

use super::{ApplyContext, Processor};
use crate::cluster::Cluster;
use crate::commands;
use crate::dispatch::{fan_out, DispatchMode};
use crate::error::Result;
use crate::pki;
use crate::registry;
use crate::runtime::join::MASTER_KUBECONFIGS;
use crate::runtime::LifecycleState;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenStep {
    SaveClusterfile,
    MountImage,
    MountRootfs,
    ApplyRegistry,
    RegistryHosts,
    FetchCerts,
    UnmountImage,
}

impl std::fmt::Display for GenStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenStep::SaveClusterfile => write!(f, "save Clusterfile"),
            GenStep::MountImage => write!(f, "mount image"),
            GenStep::MountRootfs => write!(f, "mount rootfs"),
            GenStep::ApplyRegistry => write!(f, "apply registry"),
            GenStep::RegistryHosts => write!(f, "add registry hosts entries"),
            GenStep::FetchCerts => write!(f, "fetch certificates"),
            GenStep::UnmountImage => write!(f, "unmount image"),
        }
    }
}

pub struct GenProcessor<'a> {
    ctx: &'a ApplyContext,
}

impl<'a> GenProcessor<'a> {
    pub fn new(ctx: &'a ApplyContext) -> Self {
        Self { ctx }
    }

    async fn apply_registry(&self, cluster: &Cluster) -> Result<()> {
        let runtime = self.ctx.runtime(cluster, LifecycleState::Stable)?;
        registry::apply(
            self.ctx.remote.as_ref(),
            runtime.registry(),
            &self.ctx.remote_rootfs(cluster),
            &cluster.master0()?,
        )
        .await
    }

    async fn registry_hosts(&self, cluster: &Cluster) -> Result<()> {
        let runtime = self.ctx.runtime(cluster, LifecycleState::Stable)?;
        let entries = runtime.registry().host_entries();
        let entries_ref = entries.as_slice();
        fan_out(&cluster.all_hosts(), DispatchMode::FailFast, "registry hosts", |host| async move {
            self.ctx.remote.cmd_async(&host, entries_ref).await
        })
        .await
    }

    async fn fetch_certs(&self, cluster: &Cluster) -> Result<()> {
        let master0 = cluster.master0()?;
        let paths = self.ctx.paths(cluster);
        for file in pki::SHARED_CA_FILES {
            let remote = format!("{}/pki/{}", commands::KUBE_DIR, file);
            self.ctx
                .remote
                .fetch(&master0, &remote, &paths.pki().join(file))
                .await?;
        }
        for file in MASTER_KUBECONFIGS {
            let remote = format!("{}/{}", commands::KUBE_DIR, file);
            self.ctx
                .remote
                .fetch(&master0, &remote, &paths.kubeconfigs().join(file))
                .await?;
        }
        tracing::info!("Fetched certificates of {} from {}", cluster.name(), master0);
        Ok(())
    }
}

#[async_trait]
impl Processor for GenProcessor<'_> {
    type Step = GenStep;

    fn pipeline(&self) -> Vec<GenStep> {
        vec![
            GenStep::SaveClusterfile,
            GenStep::MountImage,
            GenStep::MountRootfs,
            GenStep::ApplyRegistry,
            GenStep::RegistryHosts,
            GenStep::FetchCerts,
            GenStep::UnmountImage,
        ]
    }

    async fn run(&self, step: &GenStep, cluster: &Cluster) -> Result<()> {
        match step {
            GenStep::SaveClusterfile => self.ctx.save_clusterfile(cluster),
            GenStep::MountImage => self.ctx.images.mount_image(cluster),
            GenStep::MountRootfs => {
                self.ctx
                    .rootfs
                    .mount_rootfs(cluster, &cluster.all_hosts(), true)
                    .await
            }
            GenStep::ApplyRegistry => self.apply_registry(cluster).await,
            GenStep::RegistryHosts => self.registry_hosts(cluster).await,
            GenStep::FetchCerts => self.fetch_certs(cluster).await,
            GenStep::UnmountImage => self.ctx.images.unmount_image(cluster),
        }
    }
}
