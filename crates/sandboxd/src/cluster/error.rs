//! Cluster client error types.

use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur while talking to the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object already exists (create is idempotent for callers that want it to be).
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// The object does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// The cluster command failed.
    #[error("cluster {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// A command executed inside a pod exited non-zero.
    #[error("exec in pod {pod} exited with code {exit_code}: {stderr}")]
    ExecFailed {
        pod: String,
        exit_code: i32,
        stderr: String,
    },

    /// Failed to parse cluster output.
    #[error("failed to parse cluster output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The pod did not reach Running within the polling budget.
    #[error("timeout waiting for pod {pod} to be ready after {attempts} attempts")]
    ReadyTimeout { pod: String, attempts: u32 },

    /// The pod exists but has no IP assigned yet.
    #[error("pod {0} has no IP assigned yet")]
    PodIpUnavailable(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists(kind: &str, name: &str) -> Self {
        Self::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}
