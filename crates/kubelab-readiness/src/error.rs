use std::time::Duration;

use kubelab_kube::KubeError;
use thiserror::Error;

use crate::session::ReadinessReport;

/// Readiness polling errors
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("Workloads were not ready after {timeout:?}\n{report}")]
    Timeout {
        timeout: Duration,
        report: Box<ReadinessReport>,
    },

    #[error("Readiness checks cannot run: {0}")]
    Fatal(#[from] KubeError),
}

impl ReadinessError {
    /// Last known state, when the poll got far enough to have one
    pub fn report(&self) -> Option<&ReadinessReport> {
        match self {
            ReadinessError::Timeout { report, .. } => Some(report),
            ReadinessError::Fatal(_) => None,
        }
    }
}
