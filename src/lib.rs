//! Kubelab - readiness and local access for lab clusters
//!
//! This library re-exports the kubelab crates, providing a single entry point
//! for Rust applications that want to wait for freshly deployed workloads and
//! reach them from localhost.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use kubelab::{
//!     AccessSupervisor, ComponentHealthChecker, ForwardMapping, Kubectl, PollerConfig,
//!     ReadinessPoller, WorkloadKind, WorkloadRef,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let kubectl = Kubectl::new("kubectl").with_context(Some("kind-lab".to_string()));
//!
//! // Wait until the backend is Ready
//! let checker = ComponentHealthChecker::new(Arc::new(kubectl.clone()));
//! let poller = ReadinessPoller::new(checker, PollerConfig::default());
//! let backend = WorkloadRef::named("lab", "backend", WorkloadKind::Deployment);
//! poller.wait_until_ready(&[backend], Duration::from_secs(300)).await?;
//!
//! // Forward it to localhost:8080
//! let state_dir = kubelab::default_state_dir()?;
//! let supervisor = AccessSupervisor::new(kubectl.clone(), Arc::new(kubectl), &state_dir);
//! let report = supervisor
//!     .establish(&[ForwardMapping::new("backend", 8080, "lab", "backend", 80)])
//!     .await?;
//!
//! for record in report.records.values() {
//!     println!("{} -> {}", record.mapping.role(), record.mapping.local_url());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Components
//!
//! - **ReadinessPoller**: polls workloads until they are Ready and the application answers
//! - **ComponentHealthChecker**: staged pod checks and application probes
//! - **AccessSupervisor**: port forwards through a fallback chain of strategies
//! - **ProcessRegistry**: role to PID files that outlive the calling process
//! - **Kubectl**: the `Orchestrator` backed by the kubectl binary

// Domain types
pub use kubelab_proto::{
    ForwardMapping, ForwardRecord, Phase, PodPhase, ReadinessState, Strategy, WorkloadKind,
    WorkloadRef, WorkloadTarget, ACCEPTED_STATUS_CODES, DEFAULT_HEALTH_PATH,
};

// Orchestration
pub use kubelab_kube::{
    ExecOutput, HttpProbe, KubeError, Kubectl, NodeResources, Orchestrator, PortForwardCommand,
    ProbeError, ServicePort, TargetPort,
};

// Readiness
pub use kubelab_readiness::{
    ApplicationProbe, ApplicationStatus, CheckOutcome, ComponentHealthChecker, PollSession,
    PollerConfig, ProbeResult, ReadinessError, ReadinessEvent, ReadinessPoller, ReadinessReport,
    WorkloadStatus,
};

// Access
pub use kubelab_access::{
    default_state_dir, AccessError, AccessReport, AccessSupervisor, DetachMode, Detacher,
    HttpVerifier, LaunchError, MappingFailure, PortProbe, ProcessRegistry, ProcessStatus,
    RegistryError, StopReport, StoppedProcess, StrategyAttempt, SystemDetacher, SystemPortProbe,
    Verifier, VerifyPolicy,
};
