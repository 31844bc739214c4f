//! Collaborators shared by every processor

use crate::cluster::{Cluster, Clusterfile};
use crate::config::{ConfigDumper, FileConfigDumper};
use crate::error::{ForgeError, Result};
use crate::filesystem::{DirImageMounter, ImageMounter, RootfsMounter, SshRootfsMounter};
use crate::paths::{self, ClusterPaths};
use crate::plugin::{Phase, PluginRunner, ShellPlugins};
use crate::runtime::{KubeadmRuntime, LifecycleState, RuntimeSettings};
use crate::ssh::RemoteExec;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Files on the executing machine that give it access to the cluster
#[derive(Debug, Clone)]
pub struct LocalAccess {
    /// Home directory receiving `.kube/config`
    pub home: PathBuf,
    /// Hosts file receiving the API server entry
    pub hosts_file: PathBuf,
}

impl LocalAccess {
    /// The current user's home and `/etc/hosts`
    pub fn system() -> Option<Self> {
        dirs::home_dir().map(|home| Self {
            home,
            hosts_file: PathBuf::from("/etc/hosts"),
        })
    }
}

/// Everything a pipeline step may need
pub struct ApplyContext {
    pub remote: Arc<dyn RemoteExec>,
    pub images: Arc<dyn ImageMounter>,
    pub rootfs: Arc<dyn RootfsMounter>,
    pub configs: Arc<dyn ConfigDumper>,
    pub settings: RuntimeSettings,
    pub data_dir: PathBuf,
    pub local_access: Option<LocalAccess>,
    plugins: Mutex<Option<Arc<dyn PluginRunner>>>,
    runtime: Mutex<Option<Arc<KubeadmRuntime>>>,
}

impl ApplyContext {
    /// Production wiring over `remote`
    pub fn new(remote: Arc<dyn RemoteExec>, data_dir: PathBuf, settings: RuntimeSettings) -> Self {
        Self {
            images: Arc::new(DirImageMounter::new(data_dir.clone())),
            rootfs: Arc::new(SshRootfsMounter::new(
                remote.clone(),
                data_dir.clone(),
                settings.ssh_attempts,
            )),
            configs: Arc::new(FileConfigDumper::new(data_dir.clone())),
            local_access: LocalAccess::system(),
            remote,
            settings,
            data_dir,
            plugins: Mutex::new(None),
            runtime: Mutex::new(None),
        }
    }

    pub fn with_local_access(mut self, local_access: Option<LocalAccess>) -> Self {
        self.local_access = local_access;
        self
    }

    pub fn paths(&self, cluster: &Cluster) -> ClusterPaths {
        ClusterPaths::new(&self.data_dir, cluster.name())
    }

    /// Remote rootfs of the cluster
    pub fn remote_rootfs(&self, cluster: &Cluster) -> String {
        paths::remote_rootfs(cluster.name())
    }

    /// Load the Clusterfile plugins unless a runner is already set
    pub fn load_plugins(&self, cluster: &Cluster) -> Result<()> {
        let mut slot = self
            .plugins
            .lock()
            .map_err(|_| ForgeError::Lock("Failed to acquire plugin lock".to_string()))?;
        if slot.is_none() {
            *slot = Some(Arc::new(ShellPlugins::from_cluster(
                self.remote.clone(),
                cluster,
            )?));
        }
        Ok(())
    }

    pub async fn run_plugins(&self, cluster: &Cluster, hosts: &[String], phase: Phase) -> Result<()> {
        self.load_plugins(cluster)?;
        let runner = self
            .plugins
            .lock()
            .map_err(|_| ForgeError::Lock("Failed to acquire plugin lock".to_string()))?
            .clone();
        match runner {
            Some(runner) => runner.run(cluster, hosts, phase).await,
            None => Ok(()),
        }
    }

    /// Runtime for `cluster`, built on first use from the mounted image
    pub fn runtime(&self, cluster: &Cluster, state: LifecycleState) -> Result<Arc<KubeadmRuntime>> {
        let mut slot = self
            .runtime
            .lock()
            .map_err(|_| ForgeError::Lock("Failed to acquire runtime lock".to_string()))?;
        if let Some(runtime) = slot.as_ref() {
            return Ok(runtime.clone());
        }
        let paths = self.paths(cluster);
        let runtime = Arc::new(KubeadmRuntime::new(
            cluster,
            &paths.mount(),
            paths,
            self.settings.clone(),
            self.remote.clone(),
            state,
        )?);
        *slot = Some(runtime.clone());
        Ok(runtime)
    }

    /// Run `guest.sh` from the rootfs on Master0 when the image ships one
    pub async fn run_guest(&self, cluster: &Cluster) -> Result<()> {
        let guest = self.paths(cluster).mount().join("guest.sh");
        if !guest.exists() {
            tracing::debug!("Image {} has no guest script", cluster.image());
            return Ok(());
        }
        let master0 = cluster.master0()?;
        let rootfs = self.remote_rootfs(cluster);
        self.remote
            .copy(&master0, &guest, &format!("{}/guest.sh", rootfs))
            .await?;
        self.remote
            .cmd(&master0, &format!("cd {} && bash guest.sh", rootfs))
            .await?;
        tracing::info!("Applied guest workloads of {}", cluster.image());
        Ok(())
    }

    /// Save the descriptor as the cluster's current state
    pub fn save_clusterfile(&self, cluster: &Cluster) -> Result<()> {
        Clusterfile::from_cluster(cluster)?.save(&self.paths(cluster).clusterfile())
    }

    /// Descriptor saved by the last successful operation
    pub fn load_current(&self, name: &str) -> Result<Option<Cluster>> {
        let path = ClusterPaths::new(&self.data_dir, name).clusterfile();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Clusterfile::load(&path)?.cluster))
    }
}
