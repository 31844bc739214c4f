//! Cluster descriptors
//!
//! The desired-state model, its Clusterfile encoding and the host-list
//! diffing that drives scale operations.

pub mod clusterfile;
pub mod descriptor;
pub mod diff;

pub use clusterfile::{ConfigFile, Clusterfile, PluginSpec};
pub use descriptor::{Cluster, ClusterSpec, Host, Metadata, Role, SshCredentials};
pub use diff::{diff, ScaleDirection, ScalePlan};
