//! Workload references

use serde::{Deserialize, Serialize};

/// Kind of orchestrator object that owns a workload's pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Pod,
}

impl WorkloadKind {
    /// Resource name understood by the orchestration tool
    pub fn resource(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
            WorkloadKind::Pod => "pod",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.resource())
    }
}

impl std::str::FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deployment" | "deploy" | "deployments" => Ok(WorkloadKind::Deployment),
            "statefulset" | "sts" | "statefulsets" => Ok(WorkloadKind::StatefulSet),
            "daemonset" | "ds" | "daemonsets" => Ok(WorkloadKind::DaemonSet),
            "pod" | "po" | "pods" => Ok(WorkloadKind::Pod),
            _ => Err(format!("Unknown workload kind: {}", s)),
        }
    }
}

/// How the pods of a workload are located
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadTarget {
    /// Label selector, e.g. `app=backend`
    Selector(String),
    /// Object name; its kind decides how pods are resolved
    Name(String),
}

/// One deployable unit to watch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    namespace: String,
    target: WorkloadTarget,
    kind: WorkloadKind,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, target: WorkloadTarget, kind: WorkloadKind) -> Self {
        Self {
            namespace: namespace.into(),
            target,
            kind,
        }
    }

    /// Workload whose pods carry the given label selector
    pub fn selector(
        namespace: impl Into<String>,
        selector: impl Into<String>,
        kind: WorkloadKind,
    ) -> Self {
        Self::new(namespace, WorkloadTarget::Selector(selector.into()), kind)
    }

    /// Workload identified by its controller (or pod) name
    pub fn named(namespace: impl Into<String>, name: impl Into<String>, kind: WorkloadKind) -> Self {
        Self::new(namespace, WorkloadTarget::Name(name.into()), kind)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn target(&self) -> &WorkloadTarget {
        &self.target
    }

    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    /// Short label used in progress output and diagnostics
    pub fn display_name(&self) -> String {
        match &self.target {
            WorkloadTarget::Name(name) => format!("{}/{}", self.kind, name),
            WorkloadTarget::Selector(selector) => format!("{}[{}]", self.kind, selector),
        }
    }
}

impl std::fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.display_name())
    }
}
