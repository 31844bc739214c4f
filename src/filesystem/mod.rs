//! Cluster image and rootfs materialisation
//!
//! A cluster image is first mounted locally under `<data>/<cluster>/mount`,
//! then its contents are pushed to every host as the cluster rootfs. Both
//! steps are idempotent.

pub mod image;
pub mod rootfs;

pub use image::DirImageMounter;
pub use rootfs::SshRootfsMounter;

use crate::cluster::Cluster;
use crate::error::Result;
use async_trait::async_trait;

/// Marker left in a host's rootfs once `init.sh` has run
pub const ROOTFS_MARKER: &str = ".mounted";

/// Pushes the mounted image to hosts
#[async_trait]
pub trait RootfsMounter: Send + Sync {
    /// Materialise the rootfs on `hosts`; an initial mount also covers the
    /// registry host
    async fn mount_rootfs(&self, cluster: &Cluster, hosts: &[String], initial: bool) -> Result<()>;

    /// Run the clean-up script on `hosts` and remove their rootfs
    async fn unmount_rootfs(&self, cluster: &Cluster, hosts: &[String]) -> Result<()>;
}

/// Mounts cluster images on the local machine
pub trait ImageMounter: Send + Sync {
    fn mount_image(&self, cluster: &Cluster) -> Result<()>;
    fn unmount_image(&self, cluster: &Cluster) -> Result<()>;
    /// Remove every local file kept for the cluster
    fn clean(&self, cluster: &Cluster) -> Result<()>;
}
