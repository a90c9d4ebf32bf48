//! Subset of the orchestrator's JSON object model that we read

use std::collections::BTreeMap;

use kubelab_proto::PodPhase;
use serde::Deserialize;

use crate::orchestrator::{ServicePort, TargetPort};

#[derive(Debug, Deserialize)]
pub(crate) struct List<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    pub deletion_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PodStatus {
    pub phase: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

impl Pod {
    pub fn phase(&self) -> PodPhase {
        self.status
            .phase
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(PodPhase::Unknown)
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Pick the pod to watch: skip terminating pods, prefer running ones
pub(crate) fn select_pod(pods: &[Pod]) -> Option<String> {
    let live: Vec<&Pod> = pods.iter().filter(|p| !p.is_terminating()).collect();

    live.iter()
        .find(|p| p.phase() == PodPhase::Running)
        .or_else(|| live.first())
        .map(|p| p.metadata.name.clone())
}

#[derive(Debug, Deserialize)]
pub(crate) struct Controller {
    #[serde(default)]
    pub spec: ControllerSpec,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ControllerSpec {
    pub selector: Option<LabelSelector>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl Controller {
    /// `k=v,k2=v2` form of the controller's pod selector
    pub fn selector(&self) -> Option<String> {
        let labels = &self.spec.selector.as_ref()?.match_labels;
        if labels.is_empty() {
            return None;
        }
        Some(
            labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Service {
    #[serde(default)]
    pub spec: ServiceSpec,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ServiceSpec {
    #[serde(default)]
    pub ports: Vec<RawServicePort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawServicePort {
    pub name: Option<String>,
    pub port: u16,
    pub target_port: Option<TargetPort>,
    pub node_port: Option<u16>,
}

impl From<RawServicePort> for ServicePort {
    fn from(raw: RawServicePort) -> Self {
        ServicePort {
            name: raw.name,
            port: raw.port,
            target_port: raw.target_port,
            node_port: raw.node_port,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Node {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct NodeStatus {
    #[serde(default)]
    pub allocatable: BTreeMap<String, String>,
}
