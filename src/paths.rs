//! On-disk layout
//!
//! Everything clusterforge keeps locally lives under one data directory,
//! `/var/lib/clusterforge` unless `CLUSTERFORGE_DATA_DIR` says otherwise.
//! Remote hosts always use the default root so that a rootfs path is the
//! same no matter which machine drives the cluster.

use std::path::{Path, PathBuf};

/// Default data directory
pub const DEFAULT_DATA_DIR: &str = "/var/lib/clusterforge";

/// Environment variable overriding the local data directory
pub const DATA_DIR_ENV: &str = "CLUSTERFORGE_DATA_DIR";

/// Local data directory
pub fn data_dir() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Local image store, one directory per image
pub fn image_store(root: &Path) -> PathBuf {
    root.join("images")
}

/// Rootfs path of a cluster on every managed host
pub fn remote_rootfs(cluster_name: &str) -> String {
    format!("{}/{}/rootfs", DEFAULT_DATA_DIR, cluster_name)
}

/// Per-cluster local directories
#[derive(Debug, Clone)]
pub struct ClusterPaths {
    base: PathBuf,
}

impl ClusterPaths {
    /// Layout for a cluster under the given data directory
    pub fn new(root: &Path, cluster_name: &str) -> Self {
        Self {
            base: root.join(cluster_name),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Mounted cluster image
    pub fn mount(&self) -> PathBuf {
        self.base.join("mount")
    }

    /// Local rootfs staging directory
    pub fn rootfs(&self) -> PathBuf {
        self.base.join("rootfs")
    }

    /// Generated kubernetes PKI
    pub fn pki(&self) -> PathBuf {
        self.base.join("pki")
    }

    /// Registry certificates
    pub fn certs(&self) -> PathBuf {
        self.base.join("certs")
    }

    /// Generated kubeconfig files
    pub fn kubeconfigs(&self) -> PathBuf {
        self.base.join("kubeconfig")
    }

    /// Persisted descriptor
    pub fn clusterfile(&self) -> PathBuf {
        self.base.join("Clusterfile")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_layout() {
        let paths = ClusterPaths::new(Path::new("/data"), "prod");
        assert_eq!(paths.base(), Path::new("/data/prod"));
        assert_eq!(paths.pki(), PathBuf::from("/data/prod/pki"));
        assert_eq!(paths.clusterfile(), PathBuf::from("/data/prod/Clusterfile"));
    }

    #[test]
    fn test_remote_rootfs() {
        assert_eq!(
            remote_rootfs("prod"),
            "/var/lib/clusterforge/prod/rootfs"
        );
    }
}
