//! Cluster descriptor
//!
//! The root value describing desired state. The first master is Master0,
//! the bootstrap anchor for the lifetime of the cluster.

use crate::error::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// API version written into every Clusterfile document
pub const API_VERSION: &str = "clusterforge.io/v1";

/// Annotation carrying the raw Clusterfile the descriptor was loaded from
pub const CLUSTERFILE_ANNOTATION: &str = "clusterforge.io/clusterfile";

/// Role of a host group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Control-plane host
    Master,
    /// Worker host
    Node,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Node => write!(f, "node"),
        }
    }
}

/// SSH credentials; unset fields fall back to the cluster default
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCredentials {
    /// Login user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Login password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passwd: Option<String>,
    /// Private key path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk: Option<String>,
    /// Private key passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_passwd: Option<String>,
    /// SSH port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl SshCredentials {
    /// Fill unset fields from `fallback`
    pub fn or(&self, fallback: &SshCredentials) -> SshCredentials {
        SshCredentials {
            user: self.user.clone().or_else(|| fallback.user.clone()),
            passwd: self.passwd.clone().or_else(|| fallback.passwd.clone()),
            pk: self.pk.clone().or_else(|| fallback.pk.clone()),
            pk_passwd: self.pk_passwd.clone().or_else(|| fallback.pk_passwd.clone()),
            port: self.port.or(fallback.port),
        }
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("root")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(22)
    }
}

/// A group of hosts sharing roles and credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Host IPs
    pub ips: Vec<String>,
    /// Roles of every host in the group
    pub roles: Vec<Role>,
    /// Credentials overriding the cluster default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshCredentials>,
    /// Extra environment for plugins and scripts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

impl Host {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Descriptor metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Cluster name
    pub name: String,
    /// Free-form annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Desired cluster state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Cluster image reference
    pub image: String,
    /// Default SSH credentials
    #[serde(default)]
    pub ssh: SshCredentials,
    /// Host groups
    #[serde(default)]
    pub hosts: Vec<Host>,
    /// Extra environment for plugins and scripts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

/// Cluster descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: ClusterSpec,
}

impl Cluster {
    /// Create a descriptor with no hosts
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: "Cluster".to_string(),
            metadata: Metadata {
                name: name.to_string(),
                annotations: BTreeMap::new(),
            },
            spec: ClusterSpec {
                image: image.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn image(&self) -> &str {
        &self.spec.image
    }

    /// IPs with the given role, in declaration order, without duplicates
    pub fn ips_by_role(&self, role: Role) -> Vec<String> {
        let mut seen = HashSet::new();
        self.spec
            .hosts
            .iter()
            .filter(|h| h.has_role(role))
            .flat_map(|h| h.ips.iter())
            .filter(|ip| seen.insert(ip.as_str()))
            .cloned()
            .collect()
    }

    pub fn masters(&self) -> Vec<String> {
        self.ips_by_role(Role::Master)
    }

    pub fn nodes(&self) -> Vec<String> {
        self.ips_by_role(Role::Node)
    }

    /// All hosts, masters first
    pub fn all_hosts(&self) -> Vec<String> {
        let mut hosts = self.masters();
        for ip in self.nodes() {
            if !hosts.contains(&ip) {
                hosts.push(ip);
            }
        }
        hosts
    }

    /// The bootstrap anchor
    pub fn master0(&self) -> Result<String> {
        self.masters().into_iter().next().ok_or_else(|| {
            ForgeError::InvalidConfig(format!("cluster {} has no master hosts", self.name()))
        })
    }

    /// Credentials for a host, host group overrides first
    pub fn ssh_for(&self, ip: &str) -> SshCredentials {
        self.spec
            .hosts
            .iter()
            .find(|h| h.ips.iter().any(|i| i == ip))
            .and_then(|h| h.ssh.as_ref())
            .map(|ssh| ssh.or(&self.spec.ssh))
            .unwrap_or_else(|| self.spec.ssh.clone())
    }

    /// Environment for a host: cluster env followed by its group env
    pub fn env_for(&self, ip: &str) -> Vec<String> {
        let mut env = self.spec.env.clone();
        if let Some(host) = self.spec.hosts.iter().find(|h| h.ips.iter().any(|i| i == ip)) {
            env.extend(host.env.iter().cloned());
        }
        env
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(|s| s.as_str())
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.metadata
            .annotations
            .insert(key.to_string(), value.to_string());
    }

    /// Add hosts to a role, keeping credentials of an existing group
    pub fn add_hosts(&mut self, role: Role, ips: &[String]) {
        let existing = self.ips_by_role(role);
        let new: Vec<String> = ips
            .iter()
            .filter(|ip| !existing.contains(ip))
            .cloned()
            .collect();
        if new.is_empty() {
            return;
        }
        match self.spec.hosts.iter_mut().find(|h| h.roles == vec![role]) {
            Some(group) => group.ips.extend(new),
            None => self.spec.hosts.push(Host {
                ips: new,
                roles: vec![role],
                ..Default::default()
            }),
        }
    }

    /// Remove hosts from every group with the given role
    pub fn remove_hosts(&mut self, role: Role, ips: &[String]) {
        for group in self.spec.hosts.iter_mut().filter(|h| h.has_role(role)) {
            group.ips.retain(|ip| !ips.contains(ip));
        }
        self.spec.hosts.retain(|h| !h.ips.is_empty());
    }

    /// Reject descriptors no operation can act on
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.is_empty() {
            return Err(ForgeError::InvalidConfig("cluster name is empty".to_string()));
        }
        if self.spec.image.is_empty() {
            return Err(ForgeError::InvalidConfig(format!(
                "cluster {} has no image",
                self.name()
            )));
        }
        self.master0()?;

        let masters: HashSet<String> = self.masters().into_iter().collect();
        for ip in self.all_hosts() {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(ForgeError::InvalidConfig(format!("invalid host ip: {}", ip)));
            }
            if masters.contains(&ip) && self.nodes().contains(&ip) {
                return Err(ForgeError::InvalidConfig(format!(
                    "host {} is declared both master and node",
                    ip
                )));
            }
        }
        Ok(())
    }
}
