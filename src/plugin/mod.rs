//! Phase plugins
//!
//! Clusterfile `kind: Plugin` documents attach scripts to pipeline phases:
//!
//! ```yaml
//! apiVersion: clusterforge.io/v1
//! kind: Plugin
//! metadata:
//!   name: SHELL
//! spec:
//!   action: PostInstall
//!   on: role=master
//!   data: |
//!     kubectl taint nodes node-role.kubernetes.io/master-
//! ```

pub mod shell;

pub use shell::ShellPlugins;

use crate::cluster::Cluster;
use crate::error::{ForgeError, Result};
use async_trait::async_trait;
use std::str::FromStr;

/// Pipeline phases plugins can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Originally,
    PreInit,
    PreJoin,
    PostJoin,
    PreGuest,
    PostInstall,
    PreClean,
    PostClean,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Originally,
        Phase::PreInit,
        Phase::PreJoin,
        Phase::PostJoin,
        Phase::PreGuest,
        Phase::PostInstall,
        Phase::PreClean,
        Phase::PostClean,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Originally => "Originally",
            Phase::PreInit => "PreInit",
            Phase::PreJoin => "PreJoin",
            Phase::PostJoin => "PostJoin",
            Phase::PreGuest => "PreGuest",
            Phase::PostInstall => "PostInstall",
            Phase::PreClean => "PreClean",
            Phase::PostClean => "PostClean",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| ForgeError::Plugin(format!("unknown plugin phase {:?}", s)))
    }
}

/// Runs the plugins bound to a phase
#[async_trait]
pub trait PluginRunner: Send + Sync {
    /// Run every plugin for `phase` on the matching subset of `hosts`
    async fn run(&self, cluster: &Cluster, hosts: &[String], phase: Phase) -> Result<()>;
}
