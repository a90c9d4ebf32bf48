use std::time::Duration;
use thiserror::Error;

/// Errors returned by the orchestration collaborator
#[derive(Debug, Error)]
pub enum KubeError {
    #[error("Orchestration tool '{binary}' not found\n\nTroubleshooting:\n  • Install kubectl or set KUBELAB_KUBECTL to its path")]
    BinaryNotFound { binary: String },

    #[error("Failed to start '{binary}': {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Unexpected output from '{command}': {reason}")]
    InvalidOutput { command: String, reason: String },
}

impl KubeError {
    /// The tool itself cannot run; retrying will not help
    pub fn is_fatal(&self) -> bool {
        matches!(self, KubeError::BinaryNotFound { .. } | KubeError::Spawn { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::NotFound { .. })
    }
}

/// HTTP probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Invalid probe URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Probe of {address} timed out")]
    Timeout { address: String },

    #[error("Invalid HTTP response from {address}: {reason}")]
    InvalidResponse { address: String, reason: String },

    #[error("Unexpected HTTP status {status} from {address}")]
    UnexpectedStatus { address: String, status: u16 },
}
