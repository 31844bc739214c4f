//! Clusterfile `kind: Config` documents
//!
//! Each Config carries a file body and a path relative to the mounted image.
//! Dumping happens after the image mount and before the rootfs is pushed, so
//! the files reach every host with the rest of the rootfs.

use crate::cluster::{Cluster, Clusterfile, ConfigFile};
use crate::error::{ForgeError, Result};
use crate::paths::ClusterPaths;
use std::path::{Component, Path, PathBuf};

/// Writes Clusterfile configs into the mounted image
pub trait ConfigDumper: Send + Sync {
    fn dump(&self, cluster: &Cluster) -> Result<()>;
}

pub struct FileConfigDumper {
    data_dir: PathBuf,
}

impl FileConfigDumper {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

/// Resolve `rel` under `root`, refusing paths that climb out of it
fn resolve(root: &Path, config: &ConfigFile) -> Result<PathBuf> {
    let rel = Path::new(config.path.trim_start_matches('/'));
    if rel.as_os_str().is_empty()
        || rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(ForgeError::InvalidConfig(format!(
            "config {} has invalid path {:?}",
            config.name, config.path
        )));
    }
    Ok(root.join(rel))
}

impl ConfigDumper for FileConfigDumper {
    fn dump(&self, cluster: &Cluster) -> Result<()> {
        let configs = Clusterfile::from_cluster(cluster)?.configs;
        if configs.is_empty() {
            tracing::debug!("No configs to dump for {}", cluster.name());
            return Ok(());
        }
        let mount = ClusterPaths::new(&self.data_dir, cluster.name()).mount();
        for config in &configs {
            let path = resolve(&mount, config)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &config.data)?;
            tracing::info!("Dumped config {} to {}", config.name, path.display());
        }
        Ok(())
    }
}
