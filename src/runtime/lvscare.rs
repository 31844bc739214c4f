//! Virtual-IP load balancer static pod
//!
//! Every worker runs an IPVS virtual server on the VIP that forwards to the
//! API server of each master. The manifest is regenerated whenever the
//! master set changes.

use super::KubeadmRuntime;
use crate::commands;
use crate::dispatch::{fan_out, DispatchMode};
use crate::error::Result;

/// Render the static pod manifest
pub fn manifest(image: &str, vip: &str, masters: &[String]) -> String {
    let mut args = vec![
        "care".to_string(),
        "--vs".to_string(),
        format!("{}:6443", vip),
        "--health-path".to_string(),
        "/healthz".to_string(),
        "--health-schem".to_string(),
        "https".to_string(),
    ];
    for master in masters {
        args.push("--rs".to_string());
        args.push(format!("{}:6443", master));
    }
    let args: String = args
        .iter()
        .map(|a| format!("    - {}\n", a))
        .collect();

    format!(
        "apiVersion: v1
kind: Pod
metadata:
  name: kube-lvscare
  namespace: kube-system
  labels:
    component: kube-lvscare
    tier: control-plane
spec:
  containers:
  - name: kube-lvscare
    image: {image}
    imagePullPolicy: IfNotPresent
    command:
    - /usr/bin/lvscare
    args:
{args}    securityContext:
      privileged: true
    volumeMounts:
    - mountPath: /lib/modules
      name: lib-modules
      readOnly: true
  hostNetwork: true
  priorityClassName: system-node-critical
  volumes:
  - hostPath:
      path: /lib/modules
      type: ''
    name: lib-modules
",
        image = image,
        args = args
    )
}

impl KubeadmRuntime {
    /// Full image reference, pulled from the cluster registry
    pub fn lvscare_image(&self) -> String {
        format!("{}/{}", self.registry.repo(), self.settings.lvscare_image)
    }

    /// Write the manifest listing `masters` on one node
    pub(crate) async fn write_lvscare(&self, node: &str, masters: &[String]) -> Result<()> {
        let content = manifest(&self.lvscare_image(), &self.settings.vip, masters);
        self.write_remote(node, commands::LVSCARE_MANIFEST, &content)
            .await
    }

    /// Regenerate the manifest on every joined node concurrently
    pub(crate) async fn refresh_lvscare(&self, nodes: &[String], masters: &[String]) -> Result<()> {
        fan_out(nodes, DispatchMode::FailFast, "update lvscare", |node| async move {
            if !self
                .remote
                .is_file_exist(&node, commands::KUBELET_CONF)
                .await?
            {
                tracing::debug!("{} has not joined yet, skipping lvscare update", node);
                return Ok(());
            }
            self.write_lvscare(&node, masters).await
        })
        .await
    }
}
