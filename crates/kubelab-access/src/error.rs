use std::fmt;
use std::path::PathBuf;

use kubelab_proto::{ForwardMapping, Strategy};
use thiserror::Error;

use crate::supervisor::AccessReport;

/// Process registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid role name '{role}': use only alphanumeric characters, hyphens, and underscores")]
    InvalidRole { role: String },

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("PID file {path} does not contain a process id: {content:?}")]
    Corrupt { path: PathBuf, content: String },

    #[error("Failed to determine the home directory")]
    NoHomeDir,
}

/// Errors starting a forwarding process
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Port-forward program '{program}' not found")]
    ProgramNotFound { program: String },

    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl LaunchError {
    /// No strategy can work without the program
    pub fn is_fatal(&self) -> bool {
        matches!(self, LaunchError::ProgramNotFound { .. })
    }
}

/// Why one strategy did not produce a verified forwarder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: Strategy,
    pub error: String,
}

/// A mapping for which every strategy failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingFailure {
    pub mapping: ForwardMapping,
    pub attempts: Vec<StrategyAttempt>,
}

impl fmt::Display for MappingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: all strategies failed", self.mapping)?;
        for attempt in &self.attempts {
            write!(f, "\n    {}: {}", attempt.strategy, attempt.error)?;
        }
        Ok(())
    }
}

/// Access supervisor errors
#[derive(Debug, Error)]
pub enum AccessError {
    /// `report` holds the forwards established before the launcher failed
    #[error("Port forwarding cannot start: {source}")]
    Fatal {
        source: LaunchError,
        report: Box<AccessReport>,
    },

    #[error("{} of the requested forwards failed:\n{}", .failures.len(), render_failures(.failures))]
    PartialFailure { failures: Vec<MappingFailure> },

    #[error("Invalid forward mapping: {0}")]
    InvalidMapping(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl AccessError {
    /// Forwards that were running when the call was aborted
    pub fn report(&self) -> Option<&AccessReport> {
        match self {
            AccessError::Fatal { report, .. } => Some(report.as_ref()),
            _ => None,
        }
    }
}

fn render_failures(failures: &[MappingFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("  {}", f))
        .collect::<Vec<_>>()
        .join("\n")
}
