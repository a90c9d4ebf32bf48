//! Readiness polling
//!
//! Drives staged health checks against the orchestrator until every watched
//! workload is Ready and the application itself answers, or a deadline
//! passes. The poll state machine ([`PollSession`]) does no I/O and the
//! poller only publishes [`ReadinessEvent`]s, so callers decide how (and
//! whether) to render progress.

pub mod checker;
pub mod error;
pub mod poller;
pub mod session;

pub use checker::{ApplicationProbe, CheckOutcome, ComponentHealthChecker, ProbeResult};
pub use error::ReadinessError;
pub use poller::{PollerConfig, ReadinessEvent, ReadinessPoller};
pub use session::{ApplicationStatus, PollSession, ReadinessReport, WorkloadStatus};
