//! The orchestration interface consumed by the supervisor

use async_trait::async_trait;
use kubelab_proto::{PodPhase, WorkloadRef};
use serde::{Deserialize, Serialize};

use crate::error::KubeError;
use crate::nodes::NodeResources;

/// Port a Service forwards to inside its pods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetPort {
    Number(u16),
    Named(String),
}

/// One port exposed by a Service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
    pub target_port: Option<TargetPort>,
    pub node_port: Option<u16>,
}

impl ServicePort {
    /// Container port behind this Service port, when it is numeric
    pub fn numeric_target(&self) -> Option<u16> {
        match &self.target_port {
            Some(TargetPort::Number(port)) => Some(*port),
            Some(TargetPort::Named(_)) => None,
            None => Some(self.port),
        }
    }
}

/// Result of a command executed inside a pod
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Queries against the cluster that hosts the lab
///
/// Every method is bounded by the implementation's own timeout.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Name of a live pod backing the workload, `None` if none exists yet
    async fn find_pod(&self, workload: &WorkloadRef) -> Result<Option<String>, KubeError>;

    /// Phase of a pod
    async fn pod_phase(&self, namespace: &str, pod: &str) -> Result<PodPhase, KubeError>;

    /// Whether the pod's `Ready` condition is true
    async fn pod_ready(&self, namespace: &str, pod: &str) -> Result<bool, KubeError>;

    /// Ports exposed by a Service
    async fn service_ports(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<ServicePort>, KubeError>;

    /// Run a command inside a pod
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput, KubeError>;

    /// Allocatable resources of every node
    async fn node_resources(&self) -> Result<Vec<NodeResources>, KubeError>;
}
