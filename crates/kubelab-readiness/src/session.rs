//! Poll session state machine
//!
//! Pure bookkeeping for one `wait_until_ready` call. The poller feeds it
//! check outcomes and probe results; nothing here touches the network or
//! the clock.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kubelab_proto::{Phase, ReadinessState, WorkloadRef};
use serde::Serialize;

use crate::checker::{CheckOutcome, ProbeResult};

/// Last known state of one workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadStatus {
    pub workload: WorkloadRef,
    pub state: ReadinessState,
}

/// Last known state of the application probe chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationStatus {
    pub healthy: bool,
    pub message: String,
    pub checked_at: Option<DateTime<Utc>>,
}

impl Default for ApplicationStatus {
    fn default() -> Self {
        Self {
            healthy: false,
            message: "waiting for workloads".to_string(),
            checked_at: None,
        }
    }
}

/// Snapshot of a poll session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    pub workloads: Vec<WorkloadStatus>,
    pub application: ApplicationStatus,
    pub elapsed: Duration,
    pub iterations: u64,
}

impl ReadinessReport {
    pub fn all_ready(&self) -> bool {
        self.workloads.iter().all(|w| w.state.phase.is_ready())
    }
}

impl fmt::Display for ReadinessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for status in &self.workloads {
            writeln!(
                f,
                "  {:<40} {:<8} {}",
                status.workload.to_string(),
                status.state.phase.to_string(),
                status.state.last_message
            )?;
        }
        write!(
            f,
            "  {:<40} {:<8} {}",
            "application",
            if self.application.healthy { "healthy" } else { "waiting" },
            self.application.message
        )
    }
}

/// Readiness state of every watched workload plus the application probe
#[derive(Debug, Clone)]
pub struct PollSession {
    workloads: Vec<WorkloadStatus>,
    application: ApplicationStatus,
}

impl PollSession {
    pub fn new(workloads: &[WorkloadRef]) -> Self {
        Self {
            workloads: workloads
                .iter()
                .map(|w| WorkloadStatus {
                    workload: w.clone(),
                    state: ReadinessState::new(),
                })
                .collect(),
            application: ApplicationStatus::default(),
        }
    }

    /// Indices of workloads that still need checking
    pub fn pending(&self) -> Vec<usize> {
        self.workloads
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.state.phase.is_ready())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn workload(&self, index: usize) -> Option<&WorkloadRef> {
        self.workloads.get(index).map(|w| &w.workload)
    }

    /// Apply one check outcome; returns the new phase if it changed
    pub fn observe(
        &mut self,
        index: usize,
        outcome: &CheckOutcome,
        at: DateTime<Utc>,
    ) -> Option<Phase> {
        let status = self.workloads.get_mut(index)?;
        let phase = outcome.phase().unwrap_or(status.state.phase);

        if status.state.observe(phase, outcome.message(), at) {
            Some(status.state.phase)
        } else {
            None
        }
    }

    pub fn all_ready(&self) -> bool {
        self.workloads.iter().all(|w| w.state.phase.is_ready())
    }

    /// Record an application probe result
    ///
    /// Results only count once every workload is Ready, so a probe that ran
    /// before the last workload turned Ready cannot complete the session.
    pub fn record_application(&mut self, result: &ProbeResult, at: DateTime<Utc>) {
        if !self.all_ready() {
            return;
        }
        self.application = ApplicationStatus {
            healthy: result.healthy,
            message: result.message.clone(),
            checked_at: Some(at),
        };
    }

    pub fn is_complete(&self) -> bool {
        self.all_ready() && self.application.healthy
    }

    pub fn report(&self, elapsed: Duration, iterations: u64) -> ReadinessReport {
        ReadinessReport {
            workloads: self.workloads.clone(),
            application: self.application.clone(),
            elapsed,
            iterations,
        }
    }
}
