//! Joining masters and nodes

use super::{KubeadmRuntime, LifecycleState};
use crate::cluster::Role;
use crate::commands::{self, JoinFlags};
use crate::dispatch::{fan_out, DispatchMode};
use crate::error::Result;
use crate::kubeadm::JoinCredentials;
use crate::pki;
use crate::ssh::wait_ssh_ready;

/// Kubeconfigs a joining master receives; kubelet.conf is written by kubeadm
pub(crate) const MASTER_KUBECONFIGS: &[&str] = &["admin.conf", "controller-manager.conf", "scheduler.conf"];

impl KubeadmRuntime {
    fn join_config_path(&self) -> String {
        format!("{}/{}", self.rootfs, commands::JOIN_CONFIG)
    }

    async fn is_joined(&self, host: &str) -> Result<bool> {
        self.remote.is_file_exist(host, commands::KUBELET_CONF).await
    }

    /// Shared CA material, control-plane kubeconfigs, registry certificate
    /// and join configuration for one joining master
    async fn prepare_master(&self, host: &str, master0: &str, creds: &JoinCredentials) -> Result<()> {
        let pki_dir = self.paths.pki();
        for file in pki::SHARED_CA_FILES {
            let local = pki_dir.join(file);
            if !local.exists() {
                tracing::warn!("{} not found locally, kubeadm will download it", local.display());
                continue;
            }
            let remote = format!("{}/pki/{}", commands::KUBE_DIR, file);
            self.remote.copy(host, &local, &remote).await?;
        }
        for file in MASTER_KUBECONFIGS {
            let local = self.paths.kubeconfigs().join(file);
            if local.exists() {
                let remote = format!("{}/{}", commands::KUBE_DIR, file);
                self.remote.copy(host, &local, &remote).await?;
            }
        }
        self.send_registry_cert(host).await?;
        self.remote
            .cmd(host, &commands::copy_static_files(&self.rootfs))
            .await?;

        let endpoint = format!("{}:6443", master0);
        let config = self.join_config_for(host, true, &endpoint, creds).await?;
        self.write_remote(host, &self.join_config_path(), &config)
            .await
    }

    pub(crate) async fn join_control_plane(&self, masters: &[String]) -> Result<()> {
        self.require_running("join masters")?;
        if masters.is_empty() {
            return Ok(());
        }
        wait_ssh_ready(self.remote.as_ref(), masters, self.settings.ssh_attempts).await?;

        let mut pending = Vec::new();
        for host in masters {
            if self.is_joined(host).await? {
                tracing::info!("{} has already joined, skipping", host);
            } else {
                pending.push(host.clone());
            }
        }

        if !pending.is_empty() {
            self.join_pending_masters(&pending).await?;
        }

        self.update_hosts(Role::Master, masters, &[])?;
        self.persist()?;
        self.refresh_lvscare(&self.nodes()?, &self.masters()?).await?;
        self.promote()
    }

    /// Prepare and join masters that have no kubelet yet, one at a time
    async fn join_pending_masters(&self, masters: &[String]) -> Result<()> {
        let creds = self.join_credentials().await?;
        let master0 = self.master0()?;
        let creds_ref = &creds;
        let master0_ref = master0.as_str();
        fan_out(masters, DispatchMode::FailFast, "prepare masters", |host| async move {
            self.prepare_master(&host, master0_ref, creds_ref).await
        })
        .await?;

        let domain = &self.settings.apiserver_domain;
        let endpoint = format!("{}:6443", master0);
        for host in masters {
            tracing::info!("Start to join {} as master", host);

            let mut cmds = self.registry.host_entries();
            cmds.push(commands::add_etc_hosts(&master0, domain));
            if let Some(login) = self.registry.login_command() {
                cmds.push(login);
            }
            cmds.push(commands::kubeadm_join(
                &self.rootfs,
                &self.version,
                true,
                &JoinFlags {
                    endpoint: &endpoint,
                    token: &creds.token,
                    ca_hash: &creds.ca_hash,
                    certificate_key: &creds.certificate_key,
                },
                self.settings.debug,
            ));
            cmds.push(commands::update_etc_hosts(
                &format!("{} {}", master0, domain),
                &format!("{} {}", host, domain),
            ));
            cmds.push(commands::register_clean(
                &self.rootfs,
                &commands::remove_etc_hosts(domain),
            ));
            cmds.push(commands::copy_kubeconfig());
            if self.version.needs_kubeconfig_fix() {
                cmds.push(commands::replace_kubeconfig_server(domain, host));
            }
            self.remote.cmd_async(host, &cmds).await?;

            tracing::info!("Succeeded in joining {} as master", host);
        }
        Ok(())
    }

    pub(crate) async fn join_workers(&self, nodes: &[String]) -> Result<()> {
        self.require_running("join nodes")?;
        if nodes.is_empty() {
            return Ok(());
        }
        wait_ssh_ready(self.remote.as_ref(), nodes, self.settings.ssh_attempts).await?;

        let creds = self.join_credentials().await?;
        let masters = self.masters()?;
        let endpoint = format!("{}:6443", self.settings.vip);
        let (creds_ref, masters_ref, endpoint_ref) = (&creds, &masters, endpoint.as_str());
        fan_out(nodes, DispatchMode::FailFast, "join nodes", |node| async move {
            self.join_worker(&node, endpoint_ref, masters_ref, creds_ref)
                .await
        })
        .await?;

        self.update_hosts(Role::Node, nodes, &[])?;
        self.persist()?;
        self.promote()
    }

    async fn join_worker(
        &self,
        node: &str,
        endpoint: &str,
        masters: &[String],
        creds: &JoinCredentials,
    ) -> Result<()> {
        if self.is_joined(node).await? {
            tracing::info!("{} has already joined, skipping", node);
            return Ok(());
        }
        tracing::info!("Start to join {} as worker", node);

        let config = self.join_config_for(node, false, endpoint, creds).await?;
        let domain = &self.settings.apiserver_domain;

        let mut cmds = self.registry_commands();
        cmds.push(commands::write_file(&self.join_config_path(), &config));
        cmds.push(commands::add_etc_hosts(&self.settings.vip, domain));
        cmds.push(commands::register_clean(
            &self.rootfs,
            &commands::remove_etc_hosts(domain),
        ));
        cmds.push(commands::add_ipvs(&self.settings.vip, masters));
        self.remote.cmd_async(node, &cmds).await?;

        self.send_registry_cert(node).await?;
        self.remote
            .cmd(
                node,
                &commands::kubeadm_join(
                    &self.rootfs,
                    &self.version,
                    false,
                    &JoinFlags {
                        endpoint,
                        token: &creds.token,
                        ca_hash: &creds.ca_hash,
                        certificate_key: &creds.certificate_key,
                    },
                    self.settings.debug,
                ),
            )
            .await?;
        self.write_lvscare(node, masters).await?;

        tracing::info!("Succeeded in joining {} as worker", node);
        Ok(())
    }

    /// A bootstrapped cluster becomes stable once its first joins finish
    fn promote(&self) -> Result<()> {
        if self.state()? == LifecycleState::Bootstrapped {
            self.set_state(LifecycleState::Stable)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{ClusterRuntime, LifecycleState};
    use super::*;
    use crate::cluster::Clusterfile;
    use crate::error::ForgeError;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_masters_join_one_at_a_time() {
        let remote = fake();
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Bootstrapped);

        runtime
            .join_masters(&strings(&["10.0.0.2", "10.0.0.3"]))
            .await
            .unwrap();

        let joins: Vec<String> = remote
            .all_commands()
            .into_iter()
            .filter(|(_, c)| c.starts_with("kubeadm join"))
            .map(|(h, _)| h)
            .collect();
        assert_eq!(joins, strings(&["10.0.0.2", "10.0.0.3"]));

        // every command of the first master precedes the second master's join
        let log = remote.all_commands();
        let second_join = log
            .iter()
            .position(|(h, c)| h == "10.0.0.3" && c.starts_with("kubeadm join"))
            .unwrap();
        let first_done = log
            .iter()
            .rposition(|(h, c)| h == "10.0.0.2" && c.contains("cp /etc/kubernetes/admin.conf"))
            .unwrap();
        assert!(first_done < second_join);

        let cmds = remote.commands("10.0.0.2");
        let pos = |p: &str| cmds.iter().position(|c| c.contains(p)).unwrap();
        assert!(pos("10.0.0.1 apiserver.cluster.local' >>") < pos("kubeadm join"));
        assert!(pos("kubeadm join") < pos(r#"sed "s/10.0.0.1 apiserver.cluster.local/10.0.0.2 apiserver.cluster.local/g""#));

        assert_eq!(runtime.state().unwrap(), LifecycleState::Stable);
        assert_eq!(
            runtime.observed().unwrap().masters(),
            strings(&["10.0.0.1", "10.0.0.2", "10.0.0.3"])
        );
    }

    #[tokio::test]
    async fn test_join_master_config_carries_control_plane() {
        let remote = fake();
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);

        runtime.join_masters(&strings(&["10.0.0.2"])).await.unwrap();

        let config = remote
            .commands("10.0.0.2")
            .into_iter()
            .find(|c| c.contains("kubeadm-join-config.yaml <<"))
            .unwrap();
        assert!(config.contains("apiServerEndpoint: 10.0.0.1:6443"));
        assert!(config.contains("advertiseAddress: 10.0.0.2"));
        assert!(config.contains(KEY));
    }

    #[tokio::test]
    async fn test_joined_master_is_left_alone() {
        let remote = fake();
        remote.add_file("10.0.0.2", commands::KUBELET_CONF);
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);
        let kubeconfigs = dir.path().join("test/kubeconfig");
        std::fs::create_dir_all(&kubeconfigs).unwrap();
        for file in MASTER_KUBECONFIGS {
            std::fs::write(kubeconfigs.join(file), "apiVersion: v1\n").unwrap();
        }

        runtime.join_masters(&strings(&["10.0.0.2"])).await.unwrap();

        assert!(remote.commands("10.0.0.2").is_empty());
        assert!(remote.copies("10.0.0.2").is_empty());
        assert_eq!(
            runtime.observed().unwrap().masters(),
            strings(&["10.0.0.1", "10.0.0.2"])
        );
    }

    #[tokio::test]
    async fn test_rejoin_only_prepares_new_masters() {
        let remote = fake();
        remote.add_file("10.0.0.2", commands::KUBELET_CONF);
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);

        runtime
            .join_masters(&strings(&["10.0.0.2", "10.0.0.3"]))
            .await
            .unwrap();

        assert_eq!(remote.count("10.0.0.2", "kubeadm-join-config.yaml"), 0);
        assert_eq!(remote.count("10.0.0.3", "kubeadm-join-config.yaml <<"), 1);
        assert_eq!(remote.count("10.0.0.3", "kubeadm join"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_configs_stay_per_host() {
        let remote = fake();
        remote.respond("docker info", " Cgroup Driver: systemd\n");
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);
        let masters = strings(&[
            "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6", "10.0.0.7",
        ]);

        runtime.join_masters(&masters).await.unwrap();

        for host in &masters {
            let config = remote
                .commands(host)
                .into_iter()
                .find(|c| c.contains("kubeadm-join-config.yaml <<"))
                .unwrap();
            assert!(config.contains(&format!("advertiseAddress: {}", host)));
            assert_eq!(config.matches("advertiseAddress:").count(), 1);
            assert!(config.contains("cgroupDriver: systemd"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_node_joins_detect_driver() {
        let remote = fake();
        remote.respond("docker info", " Cgroup Driver: systemd\n");
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);
        let nodes = strings(&["10.0.0.11", "10.0.0.12", "10.0.0.13", "10.0.0.14"]);

        runtime.join_nodes(&nodes).await.unwrap();

        for node in &nodes {
            let config = remote
                .commands(node)
                .into_iter()
                .find(|c| c.contains("kubeadm-join-config.yaml <<"))
                .unwrap();
            assert!(config.contains("cgroupDriver: systemd"));
            assert!(!config.contains("controlPlane"));
        }
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let remote = fake();
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);
        let nodes = strings(&["10.0.0.5", "10.0.0.6"]);

        runtime.join_nodes(&nodes).await.unwrap();
        runtime.join_nodes(&nodes).await.unwrap();

        assert_eq!(remote.count("10.0.0.5", "kubeadm join"), 1);
        assert_eq!(remote.count("10.0.0.6", "kubeadm join"), 1);
        assert_eq!(runtime.observed().unwrap().nodes(), nodes);
    }

    #[tokio::test]
    async fn test_join_nodes_use_vip() {
        let remote = fake();
        let cluster = cluster(&["10.0.0.1", "10.0.0.2"], &[]);
        let (runtime, dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);

        runtime.join_nodes(&strings(&["10.0.0.5"])).await.unwrap();

        let cmds = remote.commands("10.0.0.5");
        let pos = |p: &str| cmds.iter().position(|c| c.contains(p)).unwrap();
        assert!(pos("10.103.97.2 apiserver.cluster.local") < pos("kubeadm join"));
        assert!(pos("seautil ipvs --vs 10.103.97.2:6443 --rs 10.0.0.1:6443 --rs 10.0.0.2:6443") < pos("kubeadm join"));
        assert!(pos("kubeadm join") < pos("kube-lvscare.yaml <<"));
        assert!(cmds[pos("kubeadm-join-config.yaml <<")].contains("apiServerEndpoint: 10.103.97.2:6443"));

        let saved = Clusterfile::load(&dir.path().join("test/Clusterfile")).unwrap();
        assert_eq!(saved.cluster.nodes(), strings(&["10.0.0.5"]));
    }

    #[tokio::test]
    async fn test_failed_node_join_reports_host() {
        let remote = fake();
        remote.fail("10.0.0.6", "kubeadm join");
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);

        let err = runtime
            .join_nodes(&strings(&["10.0.0.5", "10.0.0.6"]))
            .await
            .unwrap_err();
        match err {
            ForgeError::Fanout { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].host, "10.0.0.6");
            }
            other => panic!("unexpected error: {}", other),
        }
        // the healthy node still finished
        assert_eq!(remote.count("10.0.0.5", "kube-lvscare.yaml <<"), 1);
    }

    #[tokio::test]
    async fn test_join_empty_is_noop() {
        let remote = fake();
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);
        runtime.join_nodes(&[]).await.unwrap();
        runtime.join_masters(&[]).await.unwrap();
        assert!(remote.all_commands().is_empty());
    }
}
