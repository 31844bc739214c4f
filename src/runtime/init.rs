//! Master0 bootstrap

use super::{cgroup, KubeadmRuntime, LifecycleState};
use crate::commands;
use crate::error::{ForgeError, Result};
use crate::kubeadm::token;
use crate::pki::{self, KubeconfigSpec, PkiConfig};
use crate::registry;
use crate::ssh::wait_ssh_ready;
use std::path::Path;

impl KubeadmRuntime {
    pub(crate) async fn init_master0(&self) -> Result<()> {
        self.require("init", &[LifecycleState::Uninitialized])?;
        let master0 = self.master0()?;
        wait_ssh_ready(
            self.remote.as_ref(),
            std::slice::from_ref(&master0),
            self.settings.ssh_attempts,
        )
        .await?;

        if self
            .remote
            .is_file_exist(&master0, commands::INIT_MARKER)
            .await?
        {
            tracing::info!("{} is already initialized, skipping kubeadm init", master0);
            return self.set_state(LifecycleState::Bootstrapped);
        }

        tracing::info!("Start to init master0 {}", master0);
        let hostname = self.remote.hostname(&master0).await?;
        let driver = cgroup::detect(self.remote.as_ref(), &master0).await;

        let (init_config, pki_config) = {
            let mut config = self.lock_config()?;
            config.cgroup_driver = driver.clone();
            config.kubeadm.set_cgroup_driver(&driver);
            let pki_config = PkiConfig {
                master0: master0.clone(),
                hostname: hostname.clone(),
                masters: self.masters()?,
                apiserver_domain: self.settings.apiserver_domain.clone(),
                vip: self.settings.vip.clone(),
                service_cidr: config.kubeadm.service_cidr().to_string(),
                dns_domain: config.kubeadm.dns_domain().to_string(),
                extra_sans: config.kubeadm.cert_sans(),
            };
            (config.kubeadm.render_init()?, pki_config)
        };
        self.write_remote(
            &master0,
            &format!("{}/{}", self.rootfs, commands::INIT_CONFIG),
            &init_config,
        )
        .await?;

        let ca = self.generate_certificates(&hostname, &pki_config)?;
        self.send_certificates(&master0, &hostname).await?;

        self.remote
            .cmd(&master0, &commands::copy_static_files(&self.rootfs))
            .await?;
        registry::apply(self.remote.as_ref(), &self.registry, &self.rootfs, &master0).await?;

        self.remote
            .cmd_async(
                &master0,
                &[
                    commands::add_etc_hosts(&master0, &self.settings.apiserver_domain),
                    commands::register_clean(
                        &self.rootfs,
                        &commands::remove_etc_hosts(&self.settings.apiserver_domain),
                    ),
                ],
            )
            .await?;

        let output = self
            .remote
            .cmd(
                &master0,
                &commands::kubeadm_init(&self.rootfs, &self.version, self.settings.debug),
            )
            .await?;
        let credentials = token::parse_init_output(&output)?;

        let expected = ca.public_key_hash()?;
        if credentials.ca_hash != expected {
            tracing::warn!(
                "CA hash reported by kubeadm ({}) differs from the generated CA ({})",
                credentials.ca_hash,
                expected
            );
        }
        self.lock_config()?.credentials = Some(credentials);

        self.remote
            .cmd(&master0, &commands::copy_kubeconfig())
            .await?;
        tracing::info!("Succeeded in initializing master0 {}", master0);
        self.set_state(LifecycleState::Bootstrapped)
    }

    /// Generate the PKI, kubeconfigs and registry certificate locally
    fn generate_certificates(
        &self,
        hostname: &str,
        config: &PkiConfig,
    ) -> Result<pki::CertificateAuthority> {
        let ca = pki::generate_cluster_pki(&self.paths.pki(), config)?;
        let server = format!("https://{}:6443", self.settings.apiserver_domain);
        pki::generate_kubeconfigs(
            &ca,
            &self.paths.kubeconfigs(),
            &server,
            &KubeconfigSpec::control_plane(hostname),
        )?;
        pki::generate_registry_cert(&self.paths.certs(), &self.registry.domain, &self.registry.ip)?;
        Ok(ca)
    }

    /// Copy generated material to Master0
    async fn send_certificates(&self, master0: &str, hostname: &str) -> Result<()> {
        let pki_remote = format!("{}/pki", commands::KUBE_DIR);
        self.copy_tree(master0, &self.paths.pki(), &pki_remote)
            .await?;

        for spec in KubeconfigSpec::control_plane(hostname) {
            let local = self.paths.kubeconfigs().join(spec.file);
            let remote = format!("{}/{}", commands::KUBE_DIR, spec.file);
            self.remote.copy(master0, &local, &remote).await?;
        }

        self.send_registry_cert(master0).await?;
        let certs_remote = format!("{}/certs", self.rootfs);
        self.copy_tree(master0, &self.paths.certs(), &certs_remote)
            .await
    }

    /// Make the bootstrap machine able to reach the cluster.
    ///
    /// Fetches the admin kubeconfig into `home` unless one is already there
    /// and points the API server domain at Master0 in `hosts_file`.
    pub async fn setup_local_access(&self, home: &Path, hosts_file: &Path) -> Result<()> {
        let master0 = self.master0()?;
        let kubeconfig = home.join(".kube").join("config");
        if !kubeconfig.exists() {
            self.remote
                .fetch(&master0, "/root/.kube/config", &kubeconfig)
                .await?;
            tracing::info!("Fetched kubeconfig to {}", kubeconfig.display());
        }

        let line = format!("{} {}", master0, self.settings.apiserver_domain);
        let hosts = std::fs::read_to_string(hosts_file).unwrap_or_default();
        if !hosts.lines().any(|l| l.trim() == line) {
            let mut content = hosts;
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&line);
            content.push('\n');
            std::fs::write(hosts_file, content).map_err(|e| {
                ForgeError::Internal(format!(
                    "failed to update {}: {}",
                    hosts_file.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}
