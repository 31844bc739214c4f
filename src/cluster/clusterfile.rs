//! Clusterfile parsing and persistence
//!
//! A Clusterfile is a multi-document YAML file. Documents are told apart by
//! `kind`:
//!
//! - `Cluster`: the cluster descriptor
//! - `KubeadmConfig`: kubeadm overrides, or the raw kubeadm kinds
//!   (`InitConfiguration`, `ClusterConfiguration`, ...) directly
//! - `Config`: a file dumped into the mounted image
//! - `Plugin`: a shell plugin bound to a phase

use super::descriptor::{Cluster, API_VERSION, CLUSTERFILE_ANNOTATION};
use crate::error::{ForgeError, Result};
use crate::kubeadm::KubeadmOverrides;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;

/// A file written under the mounted image before the rootfs is distributed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub name: String,
    /// Path relative to the image root
    pub path: String,
    /// File contents
    pub data: String,
}

/// A shell plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    /// Phase the plugin runs in, e.g. `PreInit`
    pub action: String,
    /// Role (`master`, `node`) or comma separated IPs; all hosts when empty
    pub on: Option<String>,
    /// Script body
    pub data: String,
}

/// Parsed Clusterfile
#[derive(Debug, Clone)]
pub struct Clusterfile {
    pub cluster: Cluster,
    pub kubeadm: KubeadmOverrides,
    pub configs: Vec<ConfigFile>,
    pub plugins: Vec<PluginSpec>,
}

impl Clusterfile {
    /// Parse a Clusterfile from path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ForgeError::ClusterfileParse(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse a Clusterfile from string
    pub fn parse(content: &str) -> Result<Self> {
        let mut cluster: Option<Cluster> = None;
        let mut kubeadm = KubeadmOverrides::default();
        let mut configs = Vec::new();
        let mut plugins = Vec::new();

        for document in serde_yaml::Deserializer::from_str(content) {
            let doc = Value::deserialize(document)
                .map_err(|e| ForgeError::ClusterfileParse(format!("Failed to parse YAML: {}", e)))?;
            if doc.is_null() {
                continue;
            }
            let kind = doc
                .get("kind")
                .and_then(|k| k.as_str())
                .ok_or_else(|| ForgeError::ClusterfileParse("document without kind".to_string()))?
                .to_string();

            match kind.as_str() {
                "Cluster" => {
                    if cluster.is_some() {
                        return Err(ForgeError::ClusterfileParse(
                            "more than one Cluster document".to_string(),
                        ));
                    }
                    cluster = Some(serde_yaml::from_value(doc).map_err(|e| {
                        ForgeError::ClusterfileParse(format!("Invalid Cluster: {}", e))
                    })?);
                }
                "KubeadmConfig" => {
                    let spec = doc.get("spec").cloned().unwrap_or(Value::Null);
                    kubeadm.merge_from(&serde_yaml::from_value(spec).map_err(|e| {
                        ForgeError::ClusterfileParse(format!("Invalid KubeadmConfig: {}", e))
                    })?);
                }
                "InitConfiguration" | "ClusterConfiguration" | "JoinConfiguration"
                | "KubeletConfiguration" | "KubeProxyConfiguration" => {
                    kubeadm.set_kind(&kind, doc);
                }
                "Config" => configs.push(ConfigFile {
                    name: metadata_name(&doc),
                    path: spec_str(&doc, "path")?,
                    data: spec_str(&doc, "data")?,
                }),
                "Plugin" => plugins.push(PluginSpec {
                    name: metadata_name(&doc),
                    action: spec_str(&doc, "action")?,
                    on: doc
                        .get("spec")
                        .and_then(|s| s.get("on"))
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string()),
                    data: spec_str(&doc, "data")?,
                }),
                other => {
                    tracing::warn!("Ignoring unknown Clusterfile document kind: {}", other);
                }
            }
        }

        let mut cluster = cluster
            .ok_or_else(|| ForgeError::ClusterfileParse("no Cluster document".to_string()))?;
        cluster.metadata.annotations.remove(CLUSTERFILE_ANNOTATION);
        cluster.set_annotation(CLUSTERFILE_ANNOTATION, content);

        Ok(Self {
            cluster,
            kubeadm,
            configs,
            plugins,
        })
    }

    /// Re-parse the Clusterfile a descriptor was loaded from, keeping the
    /// descriptor's current host lists
    pub fn from_cluster(cluster: &Cluster) -> Result<Self> {
        match cluster.annotation(CLUSTERFILE_ANNOTATION) {
            Some(raw) => {
                let mut file = Self::parse(raw)?;
                file.cluster = cluster.clone();
                Ok(file)
            }
            None => Ok(Self {
                cluster: cluster.clone(),
                kubeadm: KubeadmOverrides::default(),
                configs: Vec::new(),
                plugins: Vec::new(),
            }),
        }
    }

    /// Render every document back to multi-document YAML
    pub fn to_yaml(&self) -> Result<String> {
        let mut cluster = self.cluster.clone();
        cluster.metadata.annotations.remove(CLUSTERFILE_ANNOTATION);

        let mut docs = vec![serde_yaml::to_string(&cluster)?];
        for doc in self.kubeadm.documents() {
            docs.push(serde_yaml::to_string(&doc)?);
        }
        for config in &self.configs {
            docs.push(document(
                "Config",
                &config.name,
                &[("path", &config.path), ("data", &config.data)],
            )?);
        }
        for plugin in &self.plugins {
            let mut spec = vec![("action", plugin.action.as_str()), ("data", plugin.data.as_str())];
            if let Some(on) = &plugin.on {
                spec.push(("on", on.as_str()));
            }
            docs.push(document("Plugin", &plugin.name, &spec)?);
        }

        Ok(docs.join("---\n"))
    }

    /// Write the Clusterfile, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_yaml()?)?;
        tracing::debug!("Saved Clusterfile to {}", path.display());
        Ok(())
    }
}

fn metadata_name(doc: &Value) -> String {
    doc.get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string()
}

fn spec_str(doc: &Value, key: &str) -> Result<String> {
    doc.get("spec")
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ForgeError::ClusterfileParse(format!(
                "{} {} has no spec.{}",
                doc.get("kind").and_then(|k| k.as_str()).unwrap_or("document"),
                metadata_name(doc),
                key
            ))
        })
}

fn document(kind: &str, name: &str, fields: &[(&str, &str)]) -> Result<String> {
    let mut metadata = serde_yaml::Mapping::new();
    metadata.insert("name".into(), name.into());

    let mut spec = serde_yaml::Mapping::new();
    for (k, v) in fields {
        spec.insert((*k).into(), (*v).into());
    }

    let mut doc = serde_yaml::Mapping::new();
    doc.insert("apiVersion".into(), API_VERSION.into());
    doc.insert("kind".into(), kind.into());
    doc.insert("metadata".into(), Value::Mapping(metadata));
    doc.insert("spec".into(), Value::Mapping(spec));
    Ok(serde_yaml::to_string(&Value::Mapping(doc))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
apiVersion: clusterforge.io/v1
kind: Cluster
metadata:
  name: prod
spec:
  image: kubernetes:v1.19.8
  ssh:
    passwd: secret
  hosts:
    - ips: [192.168.0.2, 192.168.0.3]
      roles: [master]
    - ips: [192.168.0.4]
      roles: [node]
---
apiVersion: kubeadm.k8s.io/v1beta2
kind: ClusterConfiguration
networking:
  podSubnet: 100.64.0.0/10
---
apiVersion: clusterforge.io/v1
kind: Config
metadata:
  name: calico
spec:
  path: etc/custom-resources.yaml
  data: |
    cidr: 100.64.0.0/10
---
apiVersion: clusterforge.io/v1
kind: Plugin
metadata:
  name: tune
spec:
  action: PreInit
  on: master
  data: sysctl -w net.ipv4.ip_forward=1
"#;

    #[test]
    fn test_parse_all_kinds() {
        let file = Clusterfile::parse(SAMPLE).unwrap();
        assert_eq!(file.cluster.name(), "prod");
        assert_eq!(file.cluster.masters().len(), 2);
        assert_eq!(file.configs.len(), 1);
        assert_eq!(file.configs[0].path, "etc/custom-resources.yaml");
        assert_eq!(file.plugins[0].action, "PreInit");
        assert_eq!(file.plugins[0].on.as_deref(), Some("master"));
        assert!(file.kubeadm.cluster.is_some());
        assert!(file.cluster.annotation(CLUSTERFILE_ANNOTATION).is_some());
    }

    #[test]
    fn test_missing_cluster_document() {
        let err = Clusterfile::parse("kind: Config\nspec:\n  path: a\n  data: b\n").unwrap_err();
        assert!(matches!(err, ForgeError::ClusterfileParse(_)));
    }

    #[test]
    fn test_save_and_reload_keeps_updated_hosts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prod/Clusterfile");

        let file = Clusterfile::parse(SAMPLE).unwrap();
        let mut cluster = file.cluster.clone();
        cluster.add_hosts(
            super::super::descriptor::Role::Node,
            &["192.168.0.9".to_string()],
        );

        let refreshed = Clusterfile::from_cluster(&cluster).unwrap();
        refreshed.save(&path).unwrap();

        let reloaded = Clusterfile::load(&path).unwrap();
        assert_eq!(reloaded.cluster.nodes(), vec!["192.168.0.4", "192.168.0.9"]);
        assert_eq!(reloaded.plugins.len(), 1);
        assert_eq!(reloaded.configs[0].data, "cidr: 100.64.0.0/10\n");
        assert!(reloaded.kubeadm.cluster.is_some());
    }
}
