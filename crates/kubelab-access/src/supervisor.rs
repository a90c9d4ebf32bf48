//! Access supervisor
//!
//! Establishes local access to services through a chain of forwarding
//! strategies, verifies every forwarder over HTTP and records the winners
//! in the process registry so later invocations can adopt or stop them.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kubelab_kube::{Kubectl, Orchestrator, PortForwardCommand};
use kubelab_proto::{ForwardMapping, ForwardRecord, Strategy, FORWARDER_SIGNATURE};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::detach::{DetachMode, Detacher, SystemDetacher};
use crate::error::{AccessError, LaunchError, MappingFailure, StrategyAttempt};
use crate::port::{matches_forwarder, PortProbe, SystemPortProbe};
use crate::registry::ProcessRegistry;
use crate::verify::{HttpVerifier, Verifier, VerifyPolicy};

/// Outcome of `establish`: verified forwarders plus per-mapping failures
#[derive(Debug, Clone, Default)]
pub struct AccessReport {
    pub records: BTreeMap<String, ForwardRecord>,
    pub failures: Vec<MappingFailure>,
}

impl AccessReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Treat any failed mapping as an error
    pub fn into_result(self) -> Result<BTreeMap<String, ForwardRecord>, AccessError> {
        if self.failures.is_empty() {
            Ok(self.records)
        } else {
            Err(AccessError::PartialFailure {
                failures: self.failures,
            })
        }
    }
}

/// A recorded forwarder that `stop` dealt with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoppedProcess {
    pub role: String,
    pub pid: u32,
    /// False if the process had already exited
    pub was_running: bool,
    /// False if it survived SIGKILL or was left alone as stale
    pub terminated: bool,
    /// The PID now belongs to an unrelated process, which was left alone
    pub stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub stopped: Vec<StoppedProcess>,
    /// Roles with no registry entry
    pub missing: Vec<String>,
}

/// Registry entry with liveness
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub role: String,
    pub pid: u32,
    pub alive: bool,
}

enum MappingError {
    Fatal(LaunchError),
    Exhausted(MappingFailure),
}

/// Brings up and tears down local port forwards
pub struct AccessSupervisor {
    kubectl: Kubectl,
    orchestrator: Arc<dyn Orchestrator>,
    ports: Arc<dyn PortProbe>,
    detacher: Arc<dyn Detacher>,
    verifier: Arc<dyn Verifier>,
    registry: ProcessRegistry,
    log_dir: PathBuf,
    policy: VerifyPolicy,
}

impl AccessSupervisor {
    /// Supervisor using the host's process table, keeping state in `state_dir`
    pub fn new(kubectl: Kubectl, orchestrator: Arc<dyn Orchestrator>, state_dir: &Path) -> Self {
        Self {
            kubectl,
            orchestrator,
            ports: Arc::new(SystemPortProbe::new()),
            detacher: Arc::new(SystemDetacher::new()),
            verifier: Arc::new(HttpVerifier::default()),
            registry: ProcessRegistry::new(state_dir),
            log_dir: state_dir.join("logs"),
            policy: VerifyPolicy::default(),
        }
    }

    pub fn with_port_probe(mut self, ports: Arc<dyn PortProbe>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_detacher(mut self, detacher: Arc<dyn Detacher>) -> Self {
        self.detacher = detacher;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_policy(mut self, policy: VerifyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Establish every mapping, in order
    ///
    /// A failed mapping does not stop the others; it is reported in
    /// [`AccessReport::failures`]. Only a launcher that cannot run at all
    /// aborts the call.
    pub async fn establish(&self, mappings: &[ForwardMapping]) -> Result<AccessReport, AccessError> {
        validate(mappings)?;

        let span = info_span!("access", session = %Uuid::new_v4(), mappings = mappings.len());
        async {
            let mut report = AccessReport::default();

            for (index, mapping) in mappings.iter().enumerate() {
                match self.establish_one(mapping, index == 0).await {
                    Ok(record) => {
                        self.registry.record(mapping.role(), record.pid);
                        info!(
                            role = %mapping.role(),
                            port = mapping.local_port(),
                            pid = record.pid,
                            strategy = %record.strategy,
                            "forward established"
                        );
                        report.records.insert(mapping.role().to_string(), record);
                    }
                    Err(MappingError::Exhausted(failure)) => {
                        warn!(role = %mapping.role(), port = mapping.local_port(), "all forwarding strategies failed");
                        report.failures.push(failure);
                    }
                    Err(MappingError::Fatal(source)) => {
                        return Err(AccessError::Fatal {
                            source,
                            report: Box::new(report),
                        })
                    }
                }
            }

            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn establish_one(
        &self,
        mapping: &ForwardMapping,
        primary: bool,
    ) -> Result<ForwardRecord, MappingError> {
        if let Some(record) = self.adopt(mapping).await {
            return Ok(record);
        }

        self.free_port(mapping.local_port()).await;

        let mut attempts = Vec::new();
        let mut started = Vec::new();

        for strategy in Strategy::CHAIN {
            if strategy == Strategy::Scripted {
                self.free_port(mapping.local_port()).await;
            }

            let (command, mode) = self.plan(strategy, mapping).await;
            debug!(role = %mapping.role(), strategy = %strategy, command = %command, "trying strategy");

            let pid = match self.detacher.detach(&command, &mode) {
                Ok(pid) => pid,
                Err(e) if e.is_fatal() => {
                    self.cleanup(&started).await;
                    return Err(MappingError::Fatal(e));
                }
                Err(e) => {
                    attempts.push(StrategyAttempt {
                        strategy,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            started.push(pid);

            match self.confirm(mapping.local_port(), pid, primary).await {
                Ok(()) => return Ok(ForwardRecord::new(mapping.clone(), pid, strategy)),
                Err(error) => {
                    debug!(role = %mapping.role(), strategy = %strategy, pid = pid, error = %error, "strategy failed");
                    if !self.detacher.terminate(pid).await {
                        warn!(pid = pid, "failed forwarder did not exit");
                    }
                    attempts.push(StrategyAttempt { strategy, error });
                }
            }
        }

        self.cleanup(&started).await;

        Err(MappingError::Exhausted(MappingFailure {
            mapping: mapping.clone(),
            attempts,
        }))
    }

    /// Reuse a healthy forwarder from an earlier run
    async fn adopt(&self, mapping: &ForwardMapping) -> Option<ForwardRecord> {
        let port = mapping.local_port();
        let recorded = self.recorded_forwarder(mapping).await;

        let candidate = match recorded {
            Some(pid) => Some(pid),
            None => self.ports.find_forwarding_process(port).await,
        };

        let pid = candidate?;

        match self.verifier.verify(port).await {
            Ok(()) => {
                info!(role = %mapping.role(), port = port, pid = pid, "adopting running forwarder");
                Some(ForwardRecord::new(mapping.clone(), pid, Strategy::Adopted))
            }
            Err(e) => {
                debug!(role = %mapping.role(), pid = pid, error = %e, "existing forwarder is not healthy");
                if recorded == Some(pid) && !self.detacher.terminate(pid).await {
                    warn!(role = %mapping.role(), pid = pid, "stale forwarder did not exit");
                }
                None
            }
        }
    }

    /// Registered PID, if it is still a forwarder for the mapping's port
    ///
    /// Dead or reused PIDs are dropped from the registry and never signalled.
    async fn recorded_forwarder(&self, mapping: &ForwardMapping) -> Option<u32> {
        let pid = match self.registry.read(mapping.role()) {
            Ok(pid) => pid?,
            Err(e) => {
                warn!(role = %mapping.role(), error = %e, "ignoring unreadable registry entry");
                return None;
            }
        };

        let is_forwarder = self.detacher.is_alive(pid)
            && self
                .ports
                .command_line(pid)
                .await
                .map_or(false, |cmd| matches_forwarder(&cmd, mapping.local_port()));

        if is_forwarder {
            return Some(pid);
        }

        debug!(role = %mapping.role(), pid = pid, "dropping stale registry entry");
        if let Err(e) = self.registry.remove(mapping.role()) {
            warn!(role = %mapping.role(), error = %e, "failed to remove stale registry entry");
        }
        None
    }

    /// Alive and still running a forwarder
    async fn is_forwarder(&self, pid: u32) -> bool {
        self.detacher.is_alive(pid)
            && self
                .ports
                .command_line(pid)
                .await
                .map_or(false, |cmd| cmd.contains(FORWARDER_SIGNATURE))
    }

    /// Terminate whatever holds `port`; best effort
    async fn free_port(&self, port: u16) {
        if !self.ports.port_in_use(port).await {
            return;
        }

        match self.ports.occupant(port).await {
            Some(pid) => {
                info!(port = port, pid = pid, "terminating process holding port");
                if !self.detacher.terminate(pid).await {
                    warn!(port = port, pid = pid, "port occupant did not exit");
                }
            }
            None => warn!(port = port, "port is in use but its owner could not be determined"),
        }
    }

    async fn plan(&self, strategy: Strategy, mapping: &ForwardMapping) -> (PortForwardCommand, DetachMode) {
        let namespace = mapping.remote_namespace();
        let service = format!("svc/{}", mapping.remote_service());
        let local = mapping.local_port();
        let remote = mapping.remote_port();

        match strategy {
            Strategy::DeploymentTarget => {
                let target = self.deployment_port(mapping).await;
                let resource = format!("deployment/{}", mapping.deployment());
                (
                    self.kubectl.port_forward(namespace, &resource, local, target),
                    DetachMode::Background,
                )
            }
            Strategy::Scripted => (
                self.kubectl.port_forward(namespace, &service, local, remote),
                DetachMode::NewSession,
            ),
            Strategy::Spawned => (
                self.kubectl.port_forward(namespace, &service, local, remote),
                DetachMode::Released {
                    log_path: self.log_dir.join(format!("{}.log", mapping.role())),
                },
            ),
            Strategy::DirectService | Strategy::Adopted => (
                self.kubectl.port_forward(namespace, &service, local, remote),
                DetachMode::Background,
            ),
        }
    }

    /// Container port behind the mapping's Service port
    async fn deployment_port(&self, mapping: &ForwardMapping) -> u16 {
        let ports = match self
            .orchestrator
            .service_ports(mapping.remote_namespace(), mapping.remote_service())
            .await
        {
            Ok(ports) => ports,
            Err(e) => {
                debug!(service = %mapping.remote_service(), error = %e, "service lookup failed, keeping remote port");
                return mapping.remote_port();
            }
        };

        ports
            .iter()
            .find(|p| p.port == mapping.remote_port())
            .and_then(|p| p.numeric_target())
            .unwrap_or(mapping.remote_port())
    }

    /// Settle, then verify until the attempt budget is spent
    async fn confirm(&self, port: u16, pid: u32, primary: bool) -> Result<(), String> {
        tokio::time::sleep(self.policy.settle).await;

        let attempts = self.policy.attempts(primary);
        let mut last_error = String::from("not verified");

        for attempt in 1..=attempts {
            if !self.detacher.is_alive(pid) {
                return Err(format!("process {} exited", pid));
            }

            match self.verifier.verify(port).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(port = port, attempt = attempt, error = %e, "verification failed");
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.attempt_interval).await;
            }
        }

        Err(format!(
            "not verified after {} attempts: {}",
            attempts, last_error
        ))
    }

    async fn cleanup(&self, pids: &[u32]) {
        for &pid in pids {
            if self.detacher.is_alive(pid) && !self.detacher.terminate(pid).await {
                warn!(pid = pid, "forwarder survived cleanup");
            }
        }
    }

    /// Stop recorded forwarders; every recorded role when `roles` is empty
    pub async fn stop(&self, roles: &[String]) -> Result<StopReport, AccessError> {
        let roles: Vec<String> = if roles.is_empty() {
            self.registry.list()?.into_iter().map(|(role, _)| role).collect()
        } else {
            roles.to_vec()
        };

        let mut report = StopReport::default();

        for role in roles {
            let Some(pid) = self.registry.read(&role)? else {
                report.missing.push(role);
                continue;
            };

            let alive = self.detacher.is_alive(pid);
            let stale = alive && !self.is_forwarder(pid).await;
            let was_running = alive && !stale;

            let terminated = if stale {
                false
            } else {
                !was_running || self.detacher.terminate(pid).await
            };
            if was_running && !terminated {
                warn!(role = %role, pid = pid, "forwarder did not exit");
            }

            self.registry.remove(&role)?;
            if stale {
                warn!(role = %role, pid = pid, "recorded PID now belongs to another process, leaving it running");
            } else {
                info!(role = %role, pid = pid, was_running = was_running, "forwarder stopped");
            }

            report.stopped.push(StoppedProcess {
                role,
                pid,
                was_running,
                terminated,
                stale,
            });
        }

        Ok(report)
    }

    /// Recorded forwarders with liveness
    ///
    /// A PID reused by an unrelated process reads as not alive.
    pub async fn status(&self) -> Result<Vec<ProcessStatus>, AccessError> {
        let mut statuses = Vec::new();
        for (role, pid) in self.registry.list()? {
            statuses.push(ProcessStatus {
                alive: self.is_forwarder(pid).await,
                role,
                pid,
            });
        }
        Ok(statuses)
    }
}

fn validate(mappings: &[ForwardMapping]) -> Result<(), AccessError> {
    let mut roles = HashSet::new();
    let mut ports = HashSet::new();

    for mapping in mappings {
        ProcessRegistry::validate_role(mapping.role())
            .map_err(|e| AccessError::InvalidMapping(e.to_string()))?;

        if !roles.insert(mapping.role()) {
            return Err(AccessError::InvalidMapping(format!(
                "role '{}' is mapped more than once",
                mapping.role()
            )));
        }
        if !ports.insert(mapping.local_port()) {
            return Err(AccessError::InvalidMapping(format!(
                "local port {} is mapped more than once",
                mapping.local_port()
            )));
        }
    }

    Ok(())
}
