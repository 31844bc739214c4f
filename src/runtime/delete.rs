//! Removing masters and nodes

use super::KubeadmRuntime;
use crate::cluster::Role;
use crate::commands;
use crate::dispatch::{fan_out, DispatchMode};
use crate::error::{ForgeError, Result};
use crate::registry::SEA_HUB;

impl KubeadmRuntime {
    /// Teardown commands for one host.
    ///
    /// The machine running clusterforge keeps its kubeconfig and gets the
    /// API server entry pointed back at Master0.
    pub(crate) fn cleanup_commands(&self, master0: &str, local: bool) -> Vec<String> {
        let domain = &self.settings.apiserver_domain;
        let mut cmds = vec![
            commands::clean_host(self.settings.debug),
            commands::remove_etc_hosts(&self.registry.domain),
            commands::remove_registry_certs(&self.registry.domain),
        ];
        if self.registry.domain != SEA_HUB {
            cmds.push(commands::remove_etc_hosts(SEA_HUB));
            cmds.push(commands::remove_registry_certs(SEA_HUB));
        }
        cmds.push(commands::remove_etc_hosts(domain));
        cmds.push(commands::remove_lvscare());
        if local {
            cmds.push(commands::add_etc_hosts(master0, domain));
        } else {
            cmds.push(commands::remove_kubeconfig());
        }
        cmds
    }

    /// Whether `host` is the machine this process runs on
    async fn is_local(&self, host: &str) -> bool {
        let local = gethostname::gethostname().to_string_lossy().to_string();
        match self.remote.hostname(host).await {
            Ok(name) => !name.is_empty() && name.eq_ignore_ascii_case(&local),
            Err(_) => false,
        }
    }

    /// Clean one host and drop its node object
    async fn remove_host(&self, host: &str, master0: &str) -> Result<()> {
        let name = match self.node_name(host).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!("Failed to resolve node name of {}: {}", host, e);
                None
            }
        };

        let local = self.is_local(host).await;
        self.remote
            .cmd_async(host, &self.cleanup_commands(master0, local))
            .await?;

        match name {
            Some(name) => {
                self.remote
                    .cmd(master0, &commands::delete_node(&name))
                    .await?;
                tracing::info!("Deleted node {} ({})", name, host);
            }
            None => tracing::warn!("{} is not registered, nothing to delete", host),
        }
        Ok(())
    }

    fn reject_master0(&self, hosts: &[String]) -> Result<String> {
        let master0 = self.master0()?;
        if hosts.contains(&master0) {
            return Err(ForgeError::InvalidConfig(format!(
                "cannot delete master0 {}",
                master0
            )));
        }
        Ok(master0)
    }

    pub(crate) async fn remove_masters(&self, masters: &[String]) -> Result<()> {
        self.require_running("delete masters")?;
        if masters.is_empty() {
            return Ok(());
        }
        let master0 = self.reject_master0(masters)?;
        let master0_ref = master0.as_str();

        fan_out(masters, DispatchMode::BestEffort, "delete masters", |host| async move {
            self.remove_host(&host, master0_ref).await
        })
        .await?;

        self.update_hosts(Role::Master, &[], masters)?;
        self.refresh_lvscare(&self.nodes()?, &self.masters()?).await?;
        self.persist()
    }

    pub(crate) async fn remove_workers(&self, nodes: &[String]) -> Result<()> {
        self.require_running("delete nodes")?;
        if nodes.is_empty() {
            return Ok(());
        }
        let master0 = self.reject_master0(nodes)?;
        let master0_ref = master0.as_str();

        fan_out(nodes, DispatchMode::BestEffort, "delete nodes", |host| async move {
            self.remove_host(&host, master0_ref).await
        })
        .await?;

        self.update_hosts(Role::Node, &[], nodes)?;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{ClusterRuntime, LifecycleState};
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_delete_master_rewrites_lvscare() {
        let remote = fake();
        remote.add_file("10.0.0.5", commands::KUBELET_CONF);
        remote.add_file("10.0.0.6", commands::KUBELET_CONF);
        let cluster = cluster(&["10.0.0.1", "10.0.0.2", "10.0.0.3"], &["10.0.0.5", "10.0.0.6"]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);

        runtime.delete_masters(&strings(&["10.0.0.2"])).await.unwrap();

        for node in ["10.0.0.5", "10.0.0.6"] {
            let manifest = remote
                .commands(node)
                .into_iter()
                .find(|c| c.contains("kube-lvscare.yaml <<"))
                .unwrap();
            assert!(manifest.contains("- 10.0.0.1:6443"));
            assert!(manifest.contains("- 10.0.0.3:6443"));
            assert!(!manifest.contains("10.0.0.2:6443"));
        }
        assert_eq!(
            runtime.observed().unwrap().masters(),
            strings(&["10.0.0.1", "10.0.0.3"])
        );
    }

    #[tokio::test]
    async fn test_delete_master0_rejected() {
        let remote = fake();
        let cluster = cluster(&["10.0.0.1", "10.0.0.2"], &[]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);

        let err = runtime
            .delete_masters(&strings(&["10.0.0.1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidConfig(_)));
        assert!(remote.all_commands().is_empty());
    }

    #[tokio::test]
    async fn test_delete_node_resolves_name() {
        let remote = fake();
        remote.set_hostname("10.0.0.5", "Worker-1");
        remote.respond("kubectl get nodes", "master-0\nworker-1\n");
        let cluster = cluster(&["10.0.0.1"], &["10.0.0.5"]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);

        runtime.delete_nodes(&strings(&["10.0.0.5"])).await.unwrap();

        assert_eq!(remote.count("10.0.0.1", "kubectl delete node worker-1"), 1);
        assert_eq!(remote.count("10.0.0.5", "kubeadm reset -f"), 1);
        assert_eq!(remote.count("10.0.0.5", "rm -rf ~/.kube/"), 1);
        assert_eq!(remote.count("10.0.0.5", r#"sed -i "/sea.hub/d" /etc/hosts"#), 1);
        assert_eq!(
            remote.count("10.0.0.5", r#"sed -i "/apiserver.cluster.local/d" /etc/hosts"#),
            1
        );
        assert!(runtime.observed().unwrap().nodes().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_best_effort() {
        let remote = fake();
        remote.set_unreachable("10.0.0.6");
        let cluster = cluster(&["10.0.0.1"], &["10.0.0.5", "10.0.0.6"]);
        let (runtime, _dir) = runtime(&cluster, remote.clone(), LifecycleState::Stable);

        runtime
            .delete_nodes(&strings(&["10.0.0.5", "10.0.0.6"]))
            .await
            .unwrap();
        assert_eq!(remote.count("10.0.0.5", "kubeadm reset -f"), 1);
        assert!(runtime.observed().unwrap().nodes().is_empty());
    }

    #[test]
    fn test_cleanup_drops_custom_registry_and_sea_hub() {
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (mut runtime, _dir) = runtime(&cluster, fake(), LifecycleState::Stable);
        runtime.registry.domain = "registry.local".to_string();

        let cmds = runtime.cleanup_commands("10.0.0.1", false);
        for domain in ["registry.local", "sea.hub"] {
            assert!(cmds.contains(&commands::remove_etc_hosts(domain)));
            assert!(cmds.contains(&commands::remove_registry_certs(domain)));
        }
        assert!(cmds.contains(&commands::remove_etc_hosts("apiserver.cluster.local")));
    }

    #[test]
    fn test_local_host_keeps_kubeconfig() {
        let cluster = cluster(&["10.0.0.1"], &[]);
        let (runtime, _dir) = runtime(&cluster, fake(), LifecycleState::Stable);

        let local = runtime.cleanup_commands("10.0.0.1", true);
        assert!(!local.contains(&commands::remove_kubeconfig()));
        assert_eq!(
            local.last().unwrap(),
            &commands::add_etc_hosts("10.0.0.1", "apiserver.cluster.local")
        );

        let remote = runtime.cleanup_commands("10.0.0.1", false);
        assert!(remote.contains(&commands::remove_kubeconfig()));
    }
}
