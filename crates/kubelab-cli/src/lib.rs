//! Kubelab CLI library
//!
//! Configuration discovery, terminal output and progress presentation used
//! by the `kubelab` binary.

pub mod config;
pub mod output;
pub mod progress;

pub use config::{Overrides, ProjectConfig, Settings};
pub use output::Output;
