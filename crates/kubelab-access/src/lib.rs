//! Local access to cluster services
//!
//! [`AccessSupervisor`] turns [`ForwardMapping`](kubelab_proto::ForwardMapping)s
//! into verified, detached port-forward processes and keeps their PIDs in a
//! [`ProcessRegistry`] so later invocations can adopt or stop them.
//!
//! The host-facing pieces sit behind traits ([`PortProbe`], [`Detacher`],
//! [`Verifier`]) with system implementations as the defaults.

pub mod detach;
pub mod error;
pub mod port;
pub mod registry;
pub mod supervisor;
pub mod verify;

pub use detach::{DetachMode, Detacher, SystemDetacher};
pub use error::{AccessError, LaunchError, MappingFailure, RegistryError, StrategyAttempt};
pub use port::{matches_forwarder, PortProbe, SystemPortProbe};
pub use registry::{default_state_dir, ProcessRegistry};
pub use supervisor::{AccessReport, AccessSupervisor, ProcessStatus, StopReport, StoppedProcess};
pub use verify::{HttpVerifier, Verifier, VerifyPolicy};
