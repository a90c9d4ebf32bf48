//! Readiness phases and per-workload state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase reported by the orchestrator for a single pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PodPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(PodPhase::Pending),
            "Running" => Ok(PodPhase::Running),
            "Succeeded" => Ok(PodPhase::Succeeded),
            "Failed" => Ok(PodPhase::Failed),
            "Unknown" | "" => Ok(PodPhase::Unknown),
            other => Err(format!("Unknown pod phase: {}", other)),
        }
    }
}

/// Readiness phase of a watched workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Unknown,
    Pending,
    Running,
    Ready,
    Failed,
}

impl Phase {
    pub fn is_ready(&self) -> bool {
        matches!(self, Phase::Ready)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Unknown => "unknown",
            Phase::Pending => "pending",
            Phase::Running => "running",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Last observed state of one workload within a poll session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReadinessState {
    pub phase: Phase,
    pub last_message: String,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Unknown,
            last_message: "not checked yet".to_string(),
            last_checked_at: None,
        }
    }

    /// Record an observation. Returns true if the phase changed.
    ///
    /// A Ready state keeps its phase; later observations only refresh the
    /// message and timestamp.
    pub fn observe(&mut self, phase: Phase, message: impl Into<String>, at: DateTime<Utc>) -> bool {
        self.last_message = message.into();
        self.last_checked_at = Some(at);

        if self.phase.is_ready() || self.phase == phase {
            return false;
        }

        self.phase = phase;
        true
    }
}
