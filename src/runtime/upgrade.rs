//! In-place kubernetes upgrade
//!
//! Masters are upgraded one at a time starting with Master0, which runs
//! `kubeadm upgrade apply`; the others follow with `kubeadm upgrade node`.
//! Nodes are upgraded concurrently once the control plane is done.

use super::KubeadmRuntime;
use crate::commands;
use crate::dispatch::{fan_out, DispatchMode};
use crate::error::Result;

impl KubeadmRuntime {
    async fn upgrade_master(&self, host: &str, master0: &str) -> Result<()> {
        let name = self.node_name_or_hostname(host).await?;
        tracing::info!("Upgrading master {} ({}) to {}", host, name, self.version);

        self.remote.cmd(master0, &commands::drain(&name)).await?;
        let upgrade = if host == master0 {
            commands::upgrade_apply(&self.version.to_string())
        } else {
            commands::upgrade_node()
        };
        self.remote
            .cmd_async(
                host,
                &[
                    commands::install_binaries(&self.rootfs),
                    upgrade,
                    commands::restart_kubelet(),
                ],
            )
            .await?;
        self.remote.cmd(master0, &commands::uncordon(&name)).await?;
        Ok(())
    }

    pub(crate) async fn upgrade_cluster(&self) -> Result<()> {
        self.require_running("upgrade")?;
        let master0 = self.master0()?;

        let mut masters = self.masters()?;
        masters.retain(|m| m != &master0);
        masters.insert(0, master0.clone());
        for host in &masters {
            self.upgrade_master(host, &master0).await?;
        }

        let rootfs = self.rootfs.as_str();
        fan_out(&self.nodes()?, DispatchMode::FailFast, "upgrade nodes", |node| async move {
            self.remote
                .cmd_async(
                    &node,
                    &[
                        commands::install_binaries(rootfs),
                        commands::upgrade_node(),
                        commands::restart_kubelet(),
                    ],
                )
                .await
        })
        .await?;

        tracing::info!("Cluster upgraded to {}", self.version);
        Ok(())
    }
}
