//! Orchestration collaborator
//!
//! Narrow interface to the cluster: pod lookup, phase and readiness queries,
//! service ports, in-cluster command execution and node resources. The
//! [`Kubectl`] implementation drives the `kubectl` binary with structured
//! (`-o json`) output and an explicit timeout on every call.
//!
//! The [`http`] module holds the plain HTTP/1.1 status probe shared by the
//! readiness poller and the access supervisor.

pub mod error;
pub mod http;
pub mod kubectl;
pub mod nodes;
pub mod orchestrator;
mod resources;

pub use error::{KubeError, ProbeError};
pub use http::HttpProbe;
pub use kubectl::{Kubectl, PortForwardCommand};
pub use nodes::NodeResources;
pub use orchestrator::{ExecOutput, Orchestrator, ServicePort, TargetPort};

#[cfg(feature = "mock")]
pub use orchestrator::MockOrchestrator;
