//! Error types for clusterforge

use thiserror::Error;

/// Result type for clusterforge operations
pub type Result<T> = std::result::Result<T, ForgeError>;

/// A single host failure collected from a fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    /// Host the unit of work ran against
    pub host: String,
    /// Rendered error message
    pub message: String,
}

impl std::fmt::Display for HostFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.host, self.message)
    }
}

/// clusterforge error types
#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Clusterfile parse error: {0}")]
    ClusterfileParse(String),

    #[error("Host {host} is not reachable over ssh after {attempts} attempts")]
    SshUnreachable { host: String, attempts: u32 },

    #[error("Command failed on {host}: `{command}`: {message}")]
    RemoteCommand {
        host: String,
        command: String,
        message: String,
    },

    #[error("Failed to copy {src} to {host}:{dst}: {message}")]
    Copy {
        host: String,
        src: String,
        dst: String,
        message: String,
    },

    #[error("Unexpected output from `{command}`: {message}")]
    MalformedOutput { command: String, message: String },

    #[error("{operation} failed on {} host(s): {}", failures.len(), join_failures(failures))]
    Fanout {
        operation: String,
        failures: Vec<HostFailure>,
    },

    #[error("Cannot {operation} while the runtime is {state}")]
    InvalidTransition { operation: String, state: String },

    #[error("PKI error: {0}")]
    Pki(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// Shorthand for a remote command failure
    pub fn remote(host: &str, command: &str, message: impl Into<String>) -> Self {
        ForgeError::RemoteCommand {
            host: host.to_string(),
            command: command.to_string(),
            message: message.into(),
        }
    }
}

fn join_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
