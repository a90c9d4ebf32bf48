//! Node resource totals
//!
//! The structured `get nodes -o json` query is preferred. Some environments
//! (restricted RBAC, old clients) only give us `describe nodes` text, so the
//! scraper below is kept as the last resort.

use serde::{Deserialize, Serialize};

/// Allocatable resources of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    pub name: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub pods: Option<String>,
}

impl NodeResources {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cpu: None,
            memory: None,
            pods: None,
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        let value = Some(value.to_string());
        match key {
            "cpu" => self.cpu = value,
            "memory" => self.memory = value,
            "pods" => self.pods = value,
            _ => {}
        }
    }
}

impl From<crate::resources::Node> for NodeResources {
    fn from(node: crate::resources::Node) -> Self {
        let mut resources = NodeResources::named(&node.metadata.name);
        for (key, value) in &node.status.allocatable {
            resources.set(key, value);
        }
        resources
    }
}

/// Scrape the `Allocatable:` blocks out of `describe nodes` output
pub fn parse_describe_nodes(text: &str) -> Vec<NodeResources> {
    let mut nodes = Vec::new();
    let mut current: Option<NodeResources> = None;
    let mut in_allocatable = false;

    for line in text.lines() {
        let indented = line.starts_with(' ') || line.starts_with('\t');

        if !indented {
            in_allocatable = false;

            if let Some(name) = line.strip_prefix("Name:") {
                if let Some(node) = current.take() {
                    nodes.push(node);
                }
                current = Some(NodeResources::named(name.trim()));
            } else if line.trim_end() == "Allocatable:" {
                in_allocatable = true;
            }
            continue;
        }

        if !in_allocatable {
            continue;
        }

        if let (Some(node), Some((key, value))) = (current.as_mut(), line.trim().split_once(':')) {
            node.set(key.trim(), value.trim());
        }
    }

    if let Some(node) = current {
        nodes.push(node);
    }

    nodes
}
