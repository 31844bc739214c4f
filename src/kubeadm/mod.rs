//! kubeadm configuration
//!
//! Documents are kept as YAML values so unknown fields survive a round
//! trip. Built-in defaults are overlaid first by `etc/kubeadm.yml` from the
//! cluster image, then by the Clusterfile.

pub mod merge;
pub mod token;
pub mod version;

pub use token::JoinCredentials;
pub use version::KubeVersion;

use crate::error::{ForgeError, Result};
use merge::{get_str, merge, set_path};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;

/// kubeadm overrides shipped inside a cluster image
pub const IMAGE_KUBEADM_FILE: &str = "etc/kubeadm.yml";

/// Kubernetes release assumed when nothing says otherwise
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.19.8";

const DEFAULT_TEMPLATE: &str = r#"
apiVersion: kubeadm.k8s.io/v1beta2
kind: InitConfiguration
localAPIEndpoint:
  bindPort: 6443
---
apiVersion: kubeadm.k8s.io/v1beta2
kind: ClusterConfiguration
kubernetesVersion: v1.19.8
networking:
  podSubnet: 100.64.0.0/10
  serviceSubnet: 10.96.0.0/22
  dnsDomain: cluster.local
apiServer:
  certSANs:
    - 127.0.0.1
    - localhost
  extraArgs:
    audit-policy-file: /etc/kubernetes/audit-policy.yml
    audit-log-path: /var/log/kubernetes/audit.log
    audit-log-format: json
    audit-log-maxbackup: "10"
    audit-log-maxsize: "100"
    audit-log-maxage: "7"
    enable-aggregator-routing: "true"
  extraVolumes:
    - name: audit
      hostPath: /etc/kubernetes
      mountPath: /etc/kubernetes
      pathType: DirectoryOrCreate
    - name: audit-log
      hostPath: /var/log/kubernetes
      mountPath: /var/log/kubernetes
      pathType: DirectoryOrCreate
controllerManager:
  extraArgs:
    experimental-cluster-signing-duration: 876000h
etcd:
  local:
    extraArgs:
      listen-metrics-urls: http://0.0.0.0:2381
---
apiVersion: kubeproxy.config.k8s.io/v1alpha1
kind: KubeProxyConfiguration
mode: ipvs
ipvs:
  excludeCIDRs: []
---
apiVersion: kubelet.config.k8s.io/v1beta1
kind: KubeletConfiguration
cgroupDriver: cgroupfs
authentication:
  anonymous:
    enabled: false
  webhook:
    enabled: true
authorization:
  mode: Webhook
clusterDomain: cluster.local
---
apiVersion: kubeadm.k8s.io/v1beta2
kind: JoinConfiguration
caCertPath: /etc/kubernetes/pki/ca.crt
discovery:
  timeout: 5m0s
"#;

/// Partial kubeadm documents; any field left out keeps its default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubeadmOverrides {
    #[serde(default, rename = "initConfiguration")]
    pub init: Option<Value>,
    #[serde(default, rename = "clusterConfiguration")]
    pub cluster: Option<Value>,
    #[serde(default, rename = "joinConfiguration")]
    pub join: Option<Value>,
    #[serde(default, rename = "kubeletConfiguration")]
    pub kubelet: Option<Value>,
    #[serde(default, rename = "kubeProxyConfiguration")]
    pub kube_proxy: Option<Value>,
}

impl KubeadmOverrides {
    /// Collect raw kubeadm documents by kind
    pub fn parse_documents(content: &str) -> Result<Self> {
        let mut overrides = Self::default();
        for document in serde_yaml::Deserializer::from_str(content) {
            let doc = Value::deserialize(document)?;
            if let Some(kind) = doc.get("kind").and_then(|k| k.as_str()).map(|k| k.to_string()) {
                overrides.set_kind(&kind, doc);
            }
        }
        Ok(overrides)
    }

    fn slot(&mut self, kind: &str) -> Option<&mut Option<Value>> {
        match kind {
            "InitConfiguration" => Some(&mut self.init),
            "ClusterConfiguration" => Some(&mut self.cluster),
            "JoinConfiguration" => Some(&mut self.join),
            "KubeletConfiguration" => Some(&mut self.kubelet),
            "KubeProxyConfiguration" => Some(&mut self.kube_proxy),
            _ => None,
        }
    }

    /// Merge a document of the given kind into the matching slot
    pub fn set_kind(&mut self, kind: &str, doc: Value) {
        match self.slot(kind) {
            Some(slot) => match slot {
                Some(existing) => merge(existing, &doc),
                None => *slot = Some(doc),
            },
            None => tracing::debug!("Ignoring kubeadm document of kind {}", kind),
        }
    }

    /// Field-level merge of another override set, `other` winning
    pub fn merge_from(&mut self, other: &KubeadmOverrides) {
        for (kind, value) in other.by_kind() {
            if let Some(value) = value {
                self.set_kind(kind, value.clone());
            }
        }
    }

    fn by_kind(&self) -> [(&'static str, &Option<Value>); 5] {
        [
            ("InitConfiguration", &self.init),
            ("ClusterConfiguration", &self.cluster),
            ("JoinConfiguration", &self.join),
            ("KubeletConfiguration", &self.kubelet),
            ("KubeProxyConfiguration", &self.kube_proxy),
        ]
    }

    /// Every override as a standalone document with its kind set
    pub fn documents(&self) -> Vec<Value> {
        self.by_kind()
            .into_iter()
            .filter_map(|(kind, value)| {
                let mut doc = value.clone()?;
                set_path(&mut doc, &["kind"], Value::from(kind));
                Some(doc)
            })
            .collect()
    }
}

/// Per-host values of a join document
#[derive(Debug, Clone)]
pub struct JoinParams<'a> {
    /// `host:port` of the API server the host joins through
    pub endpoint: &'a str,
    /// Address the host advertises
    pub advertise_address: &'a str,
    /// Whether the host joins the control plane
    pub control_plane: bool,
    pub cgroup_driver: &'a str,
    pub credentials: &'a JoinCredentials,
}

/// Network-level values the bootstrap documents are stamped with
#[derive(Debug, Clone)]
pub struct Endpoints<'a> {
    pub master0: &'a str,
    pub apiserver_domain: &'a str,
    pub vip: &'a str,
    pub registry_repo: &'a str,
    pub masters: &'a [String],
}

/// Fully merged kubeadm documents
#[derive(Debug, Clone, PartialEq)]
pub struct KubeadmConfig {
    pub init: Value,
    pub cluster: Value,
    pub join: Value,
    pub kubelet: Value,
    pub kube_proxy: Value,
}

impl KubeadmConfig {
    /// Built-in defaults
    pub fn defaults() -> Result<Self> {
        let base = KubeadmOverrides::parse_documents(DEFAULT_TEMPLATE)?;
        let take = |doc: Option<Value>, kind: &str| {
            doc.ok_or_else(|| ForgeError::Internal(format!("default template lacks {}", kind)))
        };
        Ok(Self {
            init: take(base.init, "InitConfiguration")?,
            cluster: take(base.cluster, "ClusterConfiguration")?,
            join: take(base.join, "JoinConfiguration")?,
            kubelet: take(base.kubelet, "KubeletConfiguration")?,
            kube_proxy: take(base.kube_proxy, "KubeProxyConfiguration")?,
        })
    }

    /// Defaults, overlaid by the image file, overlaid by `overrides`
    pub fn load(image_root: &Path, overrides: &KubeadmOverrides) -> Result<Self> {
        let mut config = Self::defaults()?;
        let image_file = image_root.join(IMAGE_KUBEADM_FILE);
        if image_file.exists() {
            let content = std::fs::read_to_string(&image_file)?;
            config.apply(&KubeadmOverrides::parse_documents(&content)?);
        }
        config.apply(overrides);
        config.stamp_versions()?;
        Ok(config)
    }

    /// Merge overrides in place
    pub fn apply(&mut self, overrides: &KubeadmOverrides) {
        let pairs = [
            (&mut self.init, &overrides.init),
            (&mut self.cluster, &overrides.cluster),
            (&mut self.join, &overrides.join),
            (&mut self.kubelet, &overrides.kubelet),
            (&mut self.kube_proxy, &overrides.kube_proxy),
        ];
        for (doc, over) in pairs {
            if let Some(over) = over {
                merge(doc, over);
            }
        }
    }

    /// Align apiVersion and CRI socket with the kubernetes release
    fn stamp_versions(&mut self) -> Result<()> {
        let version = self.kubernetes_version()?;
        let api = Value::from(version.kubeadm_api_version());
        for doc in [&mut self.init, &mut self.cluster, &mut self.join] {
            set_path(doc, &["apiVersion"], api.clone());
        }
        for doc in [&mut self.init, &mut self.join] {
            if get_str(doc, &["nodeRegistration", "criSocket"]).is_none() {
                set_path(
                    doc,
                    &["nodeRegistration", "criSocket"],
                    Value::from(version.cri_socket()),
                );
            }
        }
        Ok(())
    }

    pub fn kubernetes_version(&self) -> Result<KubeVersion> {
        KubeVersion::parse(
            get_str(&self.cluster, &["kubernetesVersion"]).unwrap_or(DEFAULT_KUBERNETES_VERSION),
        )
    }

    pub fn service_cidr(&self) -> &str {
        get_str(&self.cluster, &["networking", "serviceSubnet"]).unwrap_or("10.96.0.0/22")
    }

    pub fn dns_domain(&self) -> &str {
        get_str(&self.cluster, &["networking", "dnsDomain"]).unwrap_or("cluster.local")
    }

    /// certSANs declared in ClusterConfiguration
    pub fn cert_sans(&self) -> Vec<String> {
        self.cluster
            .get("apiServer")
            .and_then(|a| a.get("certSANs"))
            .and_then(|s| s.as_sequence())
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stamp the bootstrap documents with the cluster's endpoints
    pub fn handle(&mut self, endpoints: &Endpoints<'_>) {
        set_path(
            &mut self.init,
            &["localAPIEndpoint", "advertiseAddress"],
            Value::from(endpoints.master0),
        );
        if self.init.get("bootstrapTokens").is_none() {
            let mut token = serde_yaml::Mapping::new();
            token.insert("token".into(), token::generate_bootstrap_token().into());
            token.insert("ttl".into(), "24h0m0s".into());
            set_path(
                &mut self.init,
                &["bootstrapTokens"],
                Value::Sequence(vec![Value::Mapping(token)]),
            );
        }

        set_path(
            &mut self.cluster,
            &["controlPlaneEndpoint"],
            Value::from(format!("{}:6443", endpoints.apiserver_domain)),
        );
        if self.cluster.get("imageRepository").is_none() {
            set_path(
                &mut self.cluster,
                &["imageRepository"],
                Value::from(endpoints.registry_repo),
            );
        }

        let mut sans = self.cert_sans();
        let mut wanted = vec![
            endpoints.apiserver_domain.to_string(),
            endpoints.vip.to_string(),
        ];
        wanted.extend(endpoints.masters.iter().cloned());
        for san in wanted {
            if !sans.contains(&san) {
                sans.push(san);
            }
        }
        set_path(
            &mut self.cluster,
            &["apiServer", "certSANs"],
            Value::Sequence(sans.into_iter().map(Value::from).collect()),
        );

        let exclude = format!("{}/32", endpoints.vip);
        let mut cidrs: Vec<Value> = self
            .kube_proxy
            .get("ipvs")
            .and_then(|i| i.get("excludeCIDRs"))
            .and_then(|c| c.as_sequence())
            .cloned()
            .unwrap_or_default();
        if !cidrs.iter().any(|c| c.as_str() == Some(exclude.as_str())) {
            cidrs.push(Value::from(exclude));
        }
        set_path(
            &mut self.kube_proxy,
            &["ipvs", "excludeCIDRs"],
            Value::Sequence(cidrs),
        );
    }

    pub fn set_cgroup_driver(&mut self, driver: &str) {
        set_path(&mut self.kubelet, &["cgroupDriver"], Value::from(driver));
    }

    /// Bootstrap documents for Master0
    pub fn render_init(&self) -> Result<String> {
        render(&[&self.init, &self.cluster, &self.kube_proxy, &self.kubelet])
    }

    /// Join documents for one host
    pub fn render_join(&self, params: &JoinParams<'_>) -> Result<String> {
        let mut join = self.join.clone();
        let mut token = serde_yaml::Mapping::new();
        token.insert("apiServerEndpoint".into(), params.endpoint.into());
        token.insert("token".into(), params.credentials.token.as_str().into());
        token.insert(
            "caCertHashes".into(),
            Value::Sequence(vec![params.credentials.ca_hash.as_str().into()]),
        );
        set_path(&mut join, &["discovery", "bootstrapToken"], Value::Mapping(token));

        if params.control_plane {
            set_path(
                &mut join,
                &["controlPlane", "localAPIEndpoint", "advertiseAddress"],
                Value::from(params.advertise_address),
            );
            set_path(
                &mut join,
                &["controlPlane", "localAPIEndpoint", "bindPort"],
                Value::from(6443),
            );
            set_path(
                &mut join,
                &["controlPlane", "certificateKey"],
                Value::from(params.credentials.certificate_key.as_str()),
            );
        } else if let Value::Mapping(map) = &mut join {
            map.remove("controlPlane");
        }

        let mut kubelet = self.kubelet.clone();
        set_path(&mut kubelet, &["cgroupDriver"], Value::from(params.cgroup_driver));
        render(&[&join, &kubelet])
    }
}

fn render(docs: &[&Value]) -> Result<String> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        out.push(serde_yaml::to_string(doc)?);
    }
    Ok(out.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn endpoints(masters: &[String]) -> Endpoints<'_> {
        Endpoints {
            master0: "192.168.0.2",
            apiserver_domain: "apiserver.cluster.local",
            vip: "10.103.97.2",
            registry_repo: "sea.hub:5000",
            masters,
        }
    }

    #[test]
    fn test_defaults_parse() {
        let config = KubeadmConfig::defaults().unwrap();
        assert_eq!(config.kubernetes_version().unwrap().to_string(), "v1.19.8");
        assert_eq!(config.service_cidr(), "10.96.0.0/22");
    }

    #[test]
    fn test_layered_overrides() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join(IMAGE_KUBEADM_FILE),
            "kind: ClusterConfiguration\nkubernetesVersion: v1.20.4\nnetworking:\n  podSubnet: 10.244.0.0/16\n",
        )
        .unwrap();

        let mut overrides = KubeadmOverrides::default();
        overrides.set_kind(
            "ClusterConfiguration",
            serde_yaml::from_str("networking:\n  serviceSubnet: 10.200.0.0/16\n").unwrap(),
        );

        let config = KubeadmConfig::load(dir.path(), &overrides).unwrap();
        assert_eq!(config.kubernetes_version().unwrap().to_string(), "v1.20.4");
        assert_eq!(config.service_cidr(), "10.200.0.0/16");
        assert_eq!(
            get_str(&config.cluster, &["networking", "podSubnet"]),
            Some("10.244.0.0/16")
        );
        assert_eq!(
            get_str(&config.init, &["nodeRegistration", "criSocket"]),
            Some("/run/containerd/containerd.sock")
        );
        assert_eq!(
            get_str(&config.cluster, &["apiVersion"]),
            Some("kubeadm.k8s.io/v1beta2")
        );
    }

    #[test]
    fn test_handle_stamps_endpoints() {
        let mut config = KubeadmConfig::defaults().unwrap();
        let masters = vec!["192.168.0.2".to_string(), "192.168.0.3".to_string()];
        config.handle(&endpoints(&masters));
        config.handle(&endpoints(&masters));

        assert_eq!(
            get_str(&config.cluster, &["controlPlaneEndpoint"]),
            Some("apiserver.cluster.local:6443")
        );
        let sans = config.cert_sans();
        assert!(sans.contains(&"192.168.0.3".to_string()));
        assert_eq!(sans.iter().filter(|s| *s == "10.103.97.2").count(), 1);

        let rendered = config.render_init().unwrap();
        assert!(rendered.contains("10.103.97.2/32"));
        assert!(rendered.contains("advertiseAddress: 192.168.0.2"));
        assert_eq!(rendered.matches("---").count(), 3);
    }

    #[test]
    fn test_render_join_for_node_drops_control_plane() {
        let mut config = KubeadmConfig::defaults().unwrap();
        set_path(
            &mut config.join,
            &["controlPlane", "localAPIEndpoint", "bindPort"],
            Value::from(6443),
        );
        let creds = JoinCredentials {
            token: "abc.def".to_string(),
            ca_hash: "sha256:00".to_string(),
            certificate_key: "k".to_string(),
        };

        let node = config
            .render_join(&JoinParams {
                endpoint: "10.103.97.2:6443",
                advertise_address: "192.168.0.9",
                control_plane: false,
                cgroup_driver: "systemd",
                credentials: &creds,
            })
            .unwrap();
        assert!(!node.contains("controlPlane"));
        assert!(node.contains("apiServerEndpoint: 10.103.97.2:6443"));
        assert!(node.contains("cgroupDriver: systemd"));

        let master = config
            .render_join(&JoinParams {
                endpoint: "192.168.0.2:6443",
                advertise_address: "192.168.0.3",
                control_plane: true,
                cgroup_driver: "cgroupfs",
                credentials: &creds,
            })
            .unwrap();
        assert!(master.contains("advertiseAddress: 192.168.0.3"));
        assert!(master.contains("certificateKey: k"));
    }
}
