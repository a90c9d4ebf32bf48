//! Port forward mappings and the records of forwarders that serve them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Technique used to bring up a forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Background forward to the Service
    DirectService,
    /// Forward launched in its own session, detached from the caller
    Scripted,
    /// Forward spawned with output redirected to a log file, handle released
    Spawned,
    /// Forward to the controller object instead of the Service
    DeploymentTarget,
    /// An already running, healthy forwarder was reused
    Adopted,
}

impl Strategy {
    /// Strategies that start a new process, in the order they are attempted
    pub const CHAIN: [Strategy; 4] = [
        Strategy::DirectService,
        Strategy::Scripted,
        Strategy::Spawned,
        Strategy::DeploymentTarget,
    ];
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::DirectService => "direct-service",
            Strategy::Scripted => "scripted",
            Strategy::Spawned => "spawned",
            Strategy::DeploymentTarget => "deployment-target",
            Strategy::Adopted => "adopted",
        };
        f.write_str(s)
    }
}

/// One desired local to remote tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardMapping {
    role: String,
    local_port: u16,
    remote_service: String,
    remote_namespace: String,
    remote_port: u16,
    deployment: Option<String>,
}

impl ForwardMapping {
    pub fn new(
        role: impl Into<String>,
        local_port: u16,
        remote_namespace: impl Into<String>,
        remote_service: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            role: role.into(),
            local_port,
            remote_service: remote_service.into(),
            remote_namespace: remote_namespace.into(),
            remote_port,
            deployment: None,
        }
    }

    /// Controller used by the last-resort strategy when it differs from the Service name
    pub fn with_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = Some(deployment.into());
        self
    }

    /// Parse `role:local_port:[namespace/]service:remote_port`
    pub fn parse(spec: &str, default_namespace: &str) -> Result<Self, String> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() != 4 {
            return Err(format!(
                "Invalid mapping '{}': expected role:local_port:[namespace/]service:remote_port",
                spec
            ));
        }

        let local_port = parts[1]
            .parse::<u16>()
            .map_err(|_| format!("Invalid local port in mapping '{}'", spec))?;
        let remote_port = parts[3]
            .parse::<u16>()
            .map_err(|_| format!("Invalid remote port in mapping '{}'", spec))?;

        let (namespace, service) = match parts[2].split_once('/') {
            Some((ns, svc)) => (ns, svc),
            None => (default_namespace, parts[2]),
        };

        if parts[0].is_empty() || service.is_empty() {
            return Err(format!("Invalid mapping '{}': empty role or service", spec));
        }

        Ok(Self::new(parts[0], local_port, namespace, service, remote_port))
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_service(&self) -> &str {
        &self.remote_service
    }

    pub fn remote_namespace(&self) -> &str {
        &self.remote_namespace
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Controller name, defaulting to the Service name
    pub fn deployment(&self) -> &str {
        self.deployment.as_deref().unwrap_or(&self.remote_service)
    }

    /// URL an operator can open once the mapping is up
    pub fn local_url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }
}

impl std::fmt::Display for ForwardMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (localhost:{} -> {}/svc/{}:{})",
            self.role, self.local_port, self.remote_namespace, self.remote_service, self.remote_port
        )
    }
}

/// A forwarder that was verified to serve a mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRecord {
    pub mapping: ForwardMapping,
    pub pid: u32,
    pub strategy: Strategy,
    pub established_at: DateTime<Utc>,
}

impl ForwardRecord {
    pub fn new(mapping: ForwardMapping, pid: u32, strategy: Strategy) -> Self {
        Self {
            mapping,
            pid,
            strategy,
            established_at: Utc::now(),
        }
    }
}
