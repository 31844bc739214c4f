//! Kubeconfig generation

use super::{CertSpec, CertUsage, CertificateAuthority};
use crate::error::Result;
use base64::Engine;
use std::path::{Path, PathBuf};

/// One kubeconfig file and the identity it carries
#[derive(Debug, Clone)]
pub struct KubeconfigSpec {
    /// File name under `/etc/kubernetes`
    pub file: &'static str,
    pub user: String,
    pub organization: Option<&'static str>,
}

impl KubeconfigSpec {
    /// Kubeconfigs kubeadm expects on a control-plane host
    pub fn control_plane(hostname: &str) -> Vec<Self> {
        vec![
            Self {
                file: "admin.conf",
                user: "kubernetes-admin".to_string(),
                organization: Some("system:masters"),
            },
            Self {
                file: "controller-manager.conf",
                user: "system:kube-controller-manager".to_string(),
                organization: None,
            },
            Self {
                file: "scheduler.conf",
                user: "system:kube-scheduler".to_string(),
                organization: None,
            },
            Self {
                file: "kubelet.conf",
                user: format!("system:node:{}", hostname),
                organization: Some("system:nodes"),
            },
        ]
    }
}

/// Render a kubeconfig with embedded credentials
pub fn render(ca_pem: &str, server: &str, user: &str, cert_pem: &str, key_pem: &str) -> String {
    let b64 = base64::engine::general_purpose::STANDARD;
    format!(
        "apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: {ca}
    server: {server}
  name: kubernetes
contexts:
- context:
    cluster: kubernetes
    user: {user}
  name: {user}@kubernetes
current-context: {user}@kubernetes
preferences: {{}}
users:
- name: {user}
  user:
    client-certificate-data: {cert}
    client-key-data: {key}
",
        ca = b64.encode(ca_pem),
        server = server,
        user = user,
        cert = b64.encode(cert_pem),
        key = b64.encode(key_pem),
    )
}

/// Write every spec into `dir`, keeping files that already exist.
/// Returns the paths written or kept.
pub fn generate_kubeconfigs(
    ca: &CertificateAuthority,
    dir: &Path,
    server: &str,
    specs: &[KubeconfigSpec],
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut paths = Vec::with_capacity(specs.len());
    for spec in specs {
        let path = dir.join(spec.file);
        if !path.exists() {
            let mut cert = CertSpec::new(spec.file, &spec.user, CertUsage::Client);
            if let Some(org) = spec.organization {
                cert = cert.org(org);
            }
            let (cert_pem, key_pem) = ca.issue(&cert)?;
            std::fs::write(
                &path,
                render(ca.cert_pem(), server, &spec.user, &cert_pem, &key_pem),
            )?;
            tracing::debug!("Wrote kubeconfig {}", path.display());
        }
        paths.push(path);
    }
    Ok(paths)
}
