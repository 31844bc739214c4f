//! ClusterForge - kubeadm cluster orchestration over SSH
//!
//! ClusterForge turns a Clusterfile and a cluster image into a running
//! Kubernetes cluster and keeps it there. It provides:
//!
//! - Ordered, re-runnable pipelines for create, scale, upgrade and delete
//! - Certificate and kubeconfig generation for the control plane
//! - Concurrent join and removal of masters and nodes
//! - A virtual-IP load balancer in front of the API servers
//! - Shell plugins hooked into pipeline phases

pub mod apply;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod filesystem;
pub mod kubeadm;
pub mod paths;
pub mod pki;
pub mod plugin;
pub mod registry;
pub mod runtime;
pub mod ssh;

pub use error::{ForgeError, Result};
