//! Kubelab domain types
//!
//! This crate defines the data model shared by the readiness poller, the
//! access supervisor and the CLI: which workloads to watch, what state they
//! were last seen in, and which local ports are forwarded to which services.

pub mod forward;
pub mod readiness;
pub mod workload;

pub use forward::{ForwardMapping, ForwardRecord, Strategy};
pub use readiness::{Phase, PodPhase, ReadinessState};
pub use workload::{WorkloadKind, WorkloadRef, WorkloadTarget};

/// Health path probed when a lab does not configure one
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// HTTP status codes that prove a forwarder is actually proxying
pub const ACCEPTED_STATUS_CODES: [u16; 3] = [200, 301, 302];

/// Command-line signature shared by every forwarding process we start
pub const FORWARDER_SIGNATURE: &str = "port-forward";
