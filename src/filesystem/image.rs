//! Directory-backed image mounter

use super::ImageMounter;
use crate::cluster::Cluster;
use crate::error::{ForgeError, Result};
use crate::paths::{self, ClusterPaths};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Record written next to a mounted image
const MOUNT_RECORD: &str = ".image.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MountRecord {
    /// Image reference
    image: String,
    /// When the image was mounted
    mounted_at: DateTime<Utc>,
}

/// Materialises images from the local image store, where each image is a
/// directory named after its reference with `/` and `:` replaced by `_`
pub struct DirImageMounter {
    data_dir: PathBuf,
}

impl DirImageMounter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Store directory holding `image`
    pub fn image_dir(&self, image: &str) -> PathBuf {
        paths::image_store(&self.data_dir).join(image.replace(['/', ':'], "_"))
    }

    fn paths(&self, cluster: &Cluster) -> ClusterPaths {
        ClusterPaths::new(&self.data_dir, cluster.name())
    }

    fn mounted_image(target: &Path) -> Option<String> {
        let content = std::fs::read_to_string(target.join(MOUNT_RECORD)).ok()?;
        serde_json::from_str::<MountRecord>(&content)
            .ok()
            .map(|r| r.image)
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| ForgeError::Mount(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| ForgeError::Mount(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

impl ImageMounter for DirImageMounter {
    fn mount_image(&self, cluster: &Cluster) -> Result<()> {
        let target = self.paths(cluster).mount();
        if let Some(mounted) = Self::mounted_image(&target) {
            if mounted == cluster.image() {
                tracing::info!("Image {} already mounted", mounted);
                return Ok(());
            }
            tracing::info!("Replacing mounted image {} with {}", mounted, cluster.image());
            std::fs::remove_dir_all(&target)?;
        }

        let source = self.image_dir(cluster.image());
        if !source.is_dir() {
            return Err(ForgeError::ImageNotFound(cluster.image().to_string()));
        }

        let base = self.paths(cluster).base().to_path_buf();
        std::fs::create_dir_all(&base)?;
        let staging = base.join(format!(".mount-{}", uuid::Uuid::new_v4()));
        if let Err(e) = copy_dir(&source, &staging) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        let record = MountRecord {
            image: cluster.image().to_string(),
            mounted_at: Utc::now(),
        };
        std::fs::write(staging.join(MOUNT_RECORD), serde_json::to_string_pretty(&record)?)?;

        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&staging, &target)?;
        tracing::info!("Mounted image {} at {}", cluster.image(), target.display());
        Ok(())
    }

    fn unmount_image(&self, cluster: &Cluster) -> Result<()> {
        let target = self.paths(cluster).mount();
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
            tracing::debug!("Unmounted image at {}", target.display());
        }
        Ok(())
    }

    fn clean(&self, cluster: &Cluster) -> Result<()> {
        let base = self.paths(cluster).base().to_path_buf();
        if base.exists() {
            std::fs::remove_dir_all(&base)?;
            tracing::info!("Removed {}", base.display());
        }
        Ok(())
    }
}
