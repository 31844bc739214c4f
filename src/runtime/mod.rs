//! kubeadm cluster runtime
//!
//! The stateful orchestrator for one cluster. It owns the merged kubeadm
//! documents, the registry location and the join credentials, and drives
//! every remote action through [`RemoteExec`]. Work against many hosts goes
//! through the fan-out dispatcher.
//!
//! Lifecycle is explicit: a runtime starts `Uninitialized` (new cluster) or
//! `Stable` (existing cluster) and rejects operations that make no sense in
//! its current state.

pub mod cgroup;
pub mod delete;
pub mod init;
pub mod join;
pub mod lvscare;
pub mod reset;
pub mod upgrade;

use crate::cluster::{Cluster, Clusterfile, Role};
use crate::commands;
use crate::error::{ForgeError, Result};
use crate::kubeadm::{token, JoinCredentials, JoinParams, KubeVersion, KubeadmConfig};
use crate::paths::{self, ClusterPaths};
use crate::registry::RegistryConfig;
use crate::ssh::RemoteExec;
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

/// Default API server domain
pub const DEFAULT_APISERVER_DOMAIN: &str = "apiserver.cluster.local";

/// Default control-plane virtual IP
pub const DEFAULT_VIP: &str = "10.103.97.2";

/// Default virtual-IP load balancer image, relative to the registry
pub const DEFAULT_LVSCARE_IMAGE: &str = "fanux/lvscare:latest";

/// Runtime settings
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Domain the API server is reached through
    pub apiserver_domain: String,
    /// Virtual IP load-balanced across masters
    pub vip: String,
    /// Liveness probes per host before giving up
    pub ssh_attempts: u32,
    /// Raise kubeadm verbosity
    pub debug: bool,
    /// Virtual-IP load balancer image
    pub lvscare_image: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            apiserver_domain: DEFAULT_APISERVER_DOMAIN.to_string(),
            vip: DEFAULT_VIP.to_string(),
            ssh_attempts: crate::ssh::DEFAULT_SSH_ATTEMPTS,
            debug: false,
            lvscare_image: DEFAULT_LVSCARE_IMAGE.to_string(),
        }
    }
}

/// Lifecycle of a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No control plane yet
    Uninitialized,
    /// Master0 initialized in this run
    Bootstrapped,
    /// Running cluster
    Stable,
    /// Tearing down
    Resetting,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Uninitialized => write!(f, "uninitialized"),
            LifecycleState::Bootstrapped => write!(f, "bootstrapped"),
            LifecycleState::Stable => write!(f, "stable"),
            LifecycleState::Resetting => write!(f, "resetting"),
        }
    }
}

/// Configuration shared by concurrent join workers
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Merged kubeadm documents
    pub kubeadm: KubeadmConfig,
    /// Join secrets, once known in this run
    pub credentials: Option<JoinCredentials>,
    /// Cgroup driver of the host whose join document was rendered last
    pub cgroup_driver: String,
    /// Advertise address of the host whose join document was rendered last
    pub advertise_address: String,
}

/// Operations a cluster runtime offers
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Bootstrap Master0
    async fn init(&self) -> Result<()>;
    async fn join_masters(&self, masters: &[String]) -> Result<()>;
    async fn join_nodes(&self, nodes: &[String]) -> Result<()>;
    async fn delete_masters(&self, masters: &[String]) -> Result<()>;
    async fn delete_nodes(&self, nodes: &[String]) -> Result<()>;
    /// Tear the whole cluster down
    async fn reset(&self) -> Result<()>;
    /// Upgrade every host to the release of the mounted image
    async fn upgrade(&self) -> Result<()>;
    /// Observed descriptor, refreshed by joins and deletes
    fn observed(&self) -> Result<Cluster>;
}

/// kubeadm-backed runtime
pub struct KubeadmRuntime {
    cluster: RwLock<Cluster>,
    settings: RuntimeSettings,
    registry: RegistryConfig,
    paths: ClusterPaths,
    rootfs: String,
    version: KubeVersion,
    remote: Arc<dyn RemoteExec>,
    config: Mutex<RuntimeConfig>,
    state: RwLock<LifecycleState>,
}

impl KubeadmRuntime {
    /// Build a runtime for `cluster` from the image mounted at `image_root`
    pub fn new(
        cluster: &Cluster,
        image_root: &Path,
        paths: ClusterPaths,
        settings: RuntimeSettings,
        remote: Arc<dyn RemoteExec>,
        state: LifecycleState,
    ) -> Result<Self> {
        let master0 = cluster.master0()?;
        let overrides = Clusterfile::from_cluster(cluster)?.kubeadm;
        let mut kubeadm = KubeadmConfig::load(image_root, &overrides)?;
        let registry = RegistryConfig::resolve(image_root, &master0)?;
        let masters = cluster.masters();
        kubeadm.handle(&crate::kubeadm::Endpoints {
            master0: &master0,
            apiserver_domain: &settings.apiserver_domain,
            vip: &settings.vip,
            registry_repo: &registry.repo(),
            masters: &masters,
        });
        let version = kubeadm.kubernetes_version()?;

        tracing::debug!(
            "Runtime for {} (kubernetes {}, registry {}, state {})",
            cluster.name(),
            version,
            registry.repo(),
            state
        );

        Ok(Self {
            cluster: RwLock::new(cluster.clone()),
            rootfs: paths::remote_rootfs(cluster.name()),
            settings,
            registry,
            paths,
            version,
            remote,
            config: Mutex::new(RuntimeConfig {
                kubeadm,
                credentials: None,
                cgroup_driver: cgroup::CGROUPFS.to_string(),
                advertise_address: master0,
            }),
            state: RwLock::new(state),
        })
    }

    pub fn state(&self) -> Result<LifecycleState> {
        self.state
            .read()
            .map(|s| *s)
            .map_err(|_| ForgeError::Lock("Failed to acquire state lock".to_string()))
    }

    fn set_state(&self, next: LifecycleState) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ForgeError::Lock("Failed to acquire state lock".to_string()))?;
        tracing::debug!("Runtime state {} -> {}", *state, next);
        *state = next;
        Ok(())
    }

    /// Fail unless the runtime is in one of `allowed`
    fn require(&self, operation: &str, allowed: &[LifecycleState]) -> Result<()> {
        let state = self.state()?;
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(ForgeError::InvalidTransition {
                operation: operation.to_string(),
                state: state.to_string(),
            })
        }
    }

    fn require_running(&self, operation: &str) -> Result<()> {
        self.require(
            operation,
            &[LifecycleState::Bootstrapped, LifecycleState::Stable],
        )
    }

    fn lock_config(&self) -> Result<std::sync::MutexGuard<'_, RuntimeConfig>> {
        self.config
            .lock()
            .map_err(|_| ForgeError::Lock("Failed to acquire runtime config lock".to_string()))
    }

    fn cluster_snapshot(&self) -> Result<Cluster> {
        self.cluster
            .read()
            .map(|c| c.clone())
            .map_err(|_| ForgeError::Lock("Failed to acquire cluster lock".to_string()))
    }

    pub fn master0(&self) -> Result<String> {
        self.cluster_snapshot()?.master0()
    }

    pub fn masters(&self) -> Result<Vec<String>> {
        Ok(self.cluster_snapshot()?.masters())
    }

    pub fn nodes(&self) -> Result<Vec<String>> {
        Ok(self.cluster_snapshot()?.nodes())
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn registry(&self) -> &RegistryConfig {
        &self.registry
    }

    pub fn kubernetes_version(&self) -> KubeVersion {
        self.version
    }

    pub fn remote(&self) -> &dyn RemoteExec {
        self.remote.as_ref()
    }

    /// Apply a host-list change to the observed descriptor
    fn update_hosts(&self, role: Role, add: &[String], remove: &[String]) -> Result<()> {
        let mut cluster = self
            .cluster
            .write()
            .map_err(|_| ForgeError::Lock("Failed to acquire cluster lock".to_string()))?;
        cluster.add_hosts(role, add);
        cluster.remove_hosts(role, remove);
        Ok(())
    }

    /// Save the observed descriptor
    fn persist(&self) -> Result<()> {
        let cluster = self.cluster_snapshot()?;
        Clusterfile::from_cluster(&cluster)?.save(&self.paths.clusterfile())
    }

    /// Token, CA hash and certificate key; fetched from Master0 once per run
    pub async fn join_credentials(&self) -> Result<JoinCredentials> {
        if let Some(creds) = self.lock_config()?.credentials.clone() {
            if creds.is_complete() {
                return Ok(creds);
            }
        }

        let master0 = self.master0()?;
        let upload = commands::upload_certs(&self.version, self.settings.debug);
        let out = self.remote.cmd(&master0, &upload).await?;
        let certificate_key = token::parse_certificate_key(&out)?;

        let create = commands::create_join_token(self.settings.debug);
        let out = self.remote.cmd(&master0, &create).await?;
        let (token, ca_hash, _) = token::parse_join_command(&out)?;

        let creds = JoinCredentials {
            token,
            ca_hash,
            certificate_key,
        };
        self.lock_config()?.credentials = Some(creds.clone());
        tracing::debug!("Fetched join credentials from {}", master0);
        Ok(creds)
    }

    /// Render the join documents for one host.
    ///
    /// The cgroup probe runs unlocked; recording the host's values and
    /// rendering happen under the config lock.
    async fn join_config_for(
        &self,
        host: &str,
        control_plane: bool,
        endpoint: &str,
        credentials: &JoinCredentials,
    ) -> Result<String> {
        let driver = cgroup::detect(self.remote.as_ref(), host).await;

        let mut config = self.lock_config()?;
        config.cgroup_driver = driver;
        config.advertise_address = host.to_string();
        config.kubeadm.render_join(&JoinParams {
            endpoint,
            advertise_address: &config.advertise_address,
            control_plane,
            cgroup_driver: &config.cgroup_driver,
            credentials,
        })
    }

    /// Registered name of a host, matched case-insensitively against its
    /// hostname in `kubectl get nodes`
    async fn node_name(&self, host: &str) -> Result<Option<String>> {
        let hostname = self.remote.hostname(host).await?;
        let master0 = self.master0()?;
        let names = self
            .remote
            .cmd(&master0, &commands::list_node_names())
            .await?;
        Ok(names
            .lines()
            .map(str::trim)
            .find(|n| !n.is_empty() && n.eq_ignore_ascii_case(&hostname))
            .map(|n| n.to_string()))
    }

    /// Node name, falling back to the lower-cased hostname
    async fn node_name_or_hostname(&self, host: &str) -> Result<String> {
        match self.node_name(host).await? {
            Some(name) => Ok(name),
            None => Ok(self.remote.hostname(host).await?.to_lowercase()),
        }
    }

    /// Write a file on a host
    async fn write_remote(&self, host: &str, path: &str, content: &str) -> Result<()> {
        self.remote
            .cmd(host, &commands::write_file(path, content))
            .await?;
        Ok(())
    }

    /// Copy every file under a local directory, preserving relative paths
    async fn copy_tree(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        for entry in walkdir::WalkDir::new(local)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let rel = entry
                .path()
                .strip_prefix(local)
                .map_err(|e| ForgeError::Internal(e.to_string()))?;
            let target = format!("{}/{}", remote, rel.display());
            self.remote.copy(host, entry.path(), &target).await?;
        }
        Ok(())
    }

    /// Copy the registry certificate where docker looks for it
    async fn send_registry_cert(&self, host: &str) -> Result<()> {
        let cert = self
            .paths
            .certs()
            .join(format!("{}.crt", self.registry.domain));
        if !cert.exists() {
            tracing::debug!("No registry certificate at {}", cert.display());
            return Ok(());
        }
        let dst = format!("{}/ca.crt", self.registry.docker_cert_dir());
        self.remote.copy(host, &cert, &dst).await
    }

    /// Commands resolving the registry on a host, with login when configured
    fn registry_commands(&self) -> Vec<String> {
        let mut cmds = self.registry.host_entries();
        if let Some(login) = self.registry.login_command() {
            cmds.push(login);
        }
        cmds
    }
}

#[async_trait]
impl ClusterRuntime for KubeadmRuntime {
    async fn init(&self) -> Result<()> {
        self.init_master0().await
    }

    async fn join_masters(&self, masters: &[String]) -> Result<()> {
        self.join_control_plane(masters).await
    }

    async fn join_nodes(&self, nodes: &[String]) -> Result<()> {
        self.join_workers(nodes).await
    }

    async fn delete_masters(&self, masters: &[String]) -> Result<()> {
        self.remove_masters(masters).await
    }

    async fn delete_nodes(&self, nodes: &[String]) -> Result<()> {
        self.remove_workers(nodes).await
    }

    async fn reset(&self) -> Result<()> {
        self.reset_cluster().await
    }

    async fn upgrade(&self) -> Result<()> {
        self.upgrade_cluster().await
    }

    fn observed(&self) -> Result<Cluster> {
        self.cluster_snapshot()
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[tokio::test]
    async fn test_join_before_init_is_rejected() {
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, fake(), LifecycleState::Uninitialized);

        let err = runtime
            .join_nodes(&["10.0.0.5".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_join_credentials_fetched_once() {
        let remote = fake();
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);

        let first = runtime.join_credentials().await.unwrap();
        let second = runtime.join_credentials().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.token, "abc.def");
        assert_eq!(first.certificate_key, KEY);
        assert_eq!(remote.count("10.0.0.1", "token create"), 1);
    }

    #[tokio::test]
    async fn test_malformed_handshake_output() {
        let remote = Arc::new(crate::ssh::fake::FakeRemote::new());
        remote.respond("phase upload-certs", "[upload-certs] Using certificate key:\nshort\n");
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote, LifecycleState::Stable);

        let err = runtime.join_credentials().await.unwrap_err();
        assert!(matches!(err, ForgeError::MalformedOutput { .. }));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::Bootstrapped.to_string(), "bootstrapped");
    }
}
