//! Kubernetes version handling

use crate::error::{ForgeError, Result};
use std::fmt;

/// `vX.Y.Z`, any pre-release or build suffix ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KubeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KubeVersion {
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        let core = trimmed
            .split(|c| c == '-' || c == '+')
            .next()
            .unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = |name: &str| -> Result<u32> {
            parts
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| ForgeError::InvalidConfig(format!("invalid {} in version {:?}", name, s)))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if core.is_empty() {
            return Err(ForgeError::InvalidConfig(format!("invalid version {:?}", s)));
        }
        Ok(Self {
            major,
            minor,
            patch,
        })
    }

    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        *self
            >= KubeVersion {
                major,
                minor,
                patch,
            }
    }

    /// kubeadm configuration API version understood by this release
    pub fn kubeadm_api_version(&self) -> &'static str {
        if self.at_least(1, 23, 0) {
            "kubeadm.k8s.io/v1beta3"
        } else if self.at_least(1, 15, 0) {
            "kubeadm.k8s.io/v1beta2"
        } else {
            "kubeadm.k8s.io/v1beta1"
        }
    }

    /// Default CRI socket shipped with this release
    pub fn cri_socket(&self) -> &'static str {
        if self.at_least(1, 20, 0) {
            "/run/containerd/containerd.sock"
        } else {
            "/var/run/dockershim.sock"
        }
    }

    /// Releases whose scheduler and controller-manager kubeconfigs must be
    /// rewritten after join
    pub fn needs_kubeconfig_fix(&self) -> bool {
        self.major == 1 && self.minor == 19 && (self.patch == 1 || self.patch == 2)
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_compare() {
        let v = KubeVersion::parse("v1.19.8").unwrap();
        assert_eq!(v.to_string(), "v1.19.8");
        assert!(v.at_least(1, 15, 0));
        assert!(!v.at_least(1, 20, 0));
        assert!(KubeVersion::parse("1.20.0-rc.1").unwrap() > v);
        assert!(KubeVersion::parse("v1.9.0").unwrap() < KubeVersion::parse("v1.10.0").unwrap());
    }

    #[test]
    fn test_api_version_selection() {
        assert_eq!(
            KubeVersion::parse("v1.14.3").unwrap().kubeadm_api_version(),
            "kubeadm.k8s.io/v1beta1"
        );
        assert_eq!(
            KubeVersion::parse("v1.19.8").unwrap().kubeadm_api_version(),
            "kubeadm.k8s.io/v1beta2"
        );
        assert_eq!(
            KubeVersion::parse("v1.24.0").unwrap().kubeadm_api_version(),
            "kubeadm.k8s.io/v1beta3"
        );
    }

    #[test]
    fn test_kubeconfig_fix_versions() {
        assert!(KubeVersion::parse("v1.19.2").unwrap().needs_kubeconfig_fix());
        assert!(!KubeVersion::parse("v1.19.3").unwrap().needs_kubeconfig_fix());
    }

    #[test]
    fn test_invalid_version() {
        assert!(KubeVersion::parse("latest").is_err());
        assert!(KubeVersion::parse("").is_err());
    }
}
