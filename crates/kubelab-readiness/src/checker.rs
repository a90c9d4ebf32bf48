//! Component health checks
//!
//! A workload check walks pod existence, then pod phase, then the container
//! readiness condition, and stops at the first step that is not satisfied.
//! "Not scheduled yet" and "crashing" lead to different remediation, so the
//! outcome keeps them apart.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kubelab_kube::{HttpProbe, KubeError, Orchestrator};
use kubelab_proto::{Phase, PodPhase, WorkloadRef, DEFAULT_HEALTH_PATH};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result of one staged workload check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No pod exists for the workload
    NotCreated,
    /// Pod exists but is not running
    Phase(PodPhase),
    /// Pod is running, containers are not ready yet
    Initializing,
    /// Pod is running and ready
    Ready,
    /// The check itself failed (timeout, API hiccup); phase unknown this round
    Unavailable(String),
}

impl CheckOutcome {
    /// Phase this outcome moves the workload to; `None` keeps the current one
    pub fn phase(&self) -> Option<Phase> {
        match self {
            CheckOutcome::NotCreated => Some(Phase::Unknown),
            CheckOutcome::Phase(PodPhase::Pending) => Some(Phase::Pending),
            CheckOutcome::Phase(PodPhase::Failed) => Some(Phase::Failed),
            CheckOutcome::Phase(PodPhase::Running) => Some(Phase::Running),
            CheckOutcome::Phase(PodPhase::Succeeded | PodPhase::Unknown) => Some(Phase::Unknown),
            CheckOutcome::Initializing => Some(Phase::Running),
            CheckOutcome::Ready => Some(Phase::Ready),
            CheckOutcome::Unavailable(_) => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            CheckOutcome::NotCreated => "not created".to_string(),
            CheckOutcome::Phase(phase) => format!("phase={}", phase),
            CheckOutcome::Initializing => "containers initializing".to_string(),
            CheckOutcome::Ready => "ready".to_string(),
            CheckOutcome::Unavailable(reason) => reason.clone(),
        }
    }
}

/// Application-level health probe, tried in configured order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ApplicationProbe {
    /// GET a URL; any 2xx is healthy
    Http { url: String },
    /// GET the Service's NodePort on `host`
    NodePort {
        namespace: String,
        service: String,
        host: String,
        path: String,
    },
    /// Fetch the health path from inside the workload's pod
    InCluster {
        workload: WorkloadRef,
        port: u16,
        path: String,
    },
}

impl ApplicationProbe {
    /// In-cluster probe of the default health path
    pub fn in_cluster(workload: WorkloadRef, port: u16) -> Self {
        ApplicationProbe::InCluster {
            workload,
            port,
            path: DEFAULT_HEALTH_PATH.to_string(),
        }
    }

    fn describe(&self) -> String {
        match self {
            ApplicationProbe::Http { url } => url.clone(),
            ApplicationProbe::NodePort {
                namespace,
                service,
                path,
                ..
            } => format!("nodeport {}/{}{}", namespace, service, path),
            ApplicationProbe::InCluster { workload, port, path } => {
                format!("{} :{}{}", workload.display_name(), port, path)
            }
        }
    }
}

/// Outcome of the application probe chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub message: String,
}

/// Runs workload checks and application probes with bounded timeouts
#[derive(Clone)]
pub struct ComponentHealthChecker {
    orchestrator: Arc<dyn Orchestrator>,
    http: HttpProbe,
    probes: Vec<ApplicationProbe>,
    probe_timeout: Duration,
}

impl ComponentHealthChecker {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        let probe_timeout = kubelab_kube::http::DEFAULT_PROBE_TIMEOUT;
        Self {
            orchestrator,
            http: HttpProbe::new().with_timeout(probe_timeout),
            probes: Vec::new(),
            probe_timeout,
        }
    }

    /// Application probes to run once all workloads are Ready
    pub fn with_probes(mut self, probes: Vec<ApplicationProbe>) -> Self {
        self.probes = probes;
        self
    }

    /// Timeout applied to every orchestrator query and HTTP probe
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self.http = HttpProbe::new().with_timeout(timeout);
        self
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T, KubeError>
    where
        F: Future<Output = Result<T, KubeError>>,
    {
        tokio::time::timeout(self.probe_timeout, fut)
            .await
            .map_err(|_| KubeError::Timeout {
                command: what.to_string(),
                timeout: self.probe_timeout,
            })?
    }

    /// Staged check: existence, phase, readiness condition
    ///
    /// Only errors that make further polling pointless are returned as `Err`.
    pub async fn check_workload(&self, workload: &WorkloadRef) -> Result<CheckOutcome, KubeError> {
        let namespace = workload.namespace();

        let pod = match self
            .bounded("find pod", self.orchestrator.find_pod(workload))
            .await
        {
            Ok(Some(pod)) => pod,
            Ok(None) => return Ok(CheckOutcome::NotCreated),
            Err(e) => return absorb(e),
        };

        let phase = match self
            .bounded("pod phase", self.orchestrator.pod_phase(namespace, &pod))
            .await
        {
            Ok(phase) => phase,
            Err(e) => return absorb(e),
        };

        if phase != PodPhase::Running {
            return Ok(CheckOutcome::Phase(phase));
        }

        match self
            .bounded("pod readiness", self.orchestrator.pod_ready(namespace, &pod))
            .await
        {
            Ok(true) => Ok(CheckOutcome::Ready),
            Ok(false) => Ok(CheckOutcome::Initializing),
            Err(e) => absorb(e),
        }
    }

    /// Run the application probes until one reports healthy
    ///
    /// With no probes configured the application counts as healthy.
    pub async fn check_application(&self) -> Result<ProbeResult, KubeError> {
        if self.probes.is_empty() {
            return Ok(ProbeResult {
                healthy: true,
                message: "no application probe configured".to_string(),
            });
        }

        let mut failures = Vec::new();

        for probe in &self.probes {
            match self.run_probe(probe).await {
                Ok(()) => {
                    return Ok(ProbeResult {
                        healthy: true,
                        message: format!("{} healthy", probe.describe()),
                    })
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(probe = %probe.describe(), error = %e, "application probe failed");
                    failures.push(format!("{}: {}", probe.describe(), e));
                }
            }
        }

        Ok(ProbeResult {
            healthy: false,
            message: failures.join("; "),
        })
    }

    async fn run_probe(&self, probe: &ApplicationProbe) -> Result<(), KubeError> {
        match probe {
            ApplicationProbe::Http { url } => self.http_ok(url).await,
            ApplicationProbe::NodePort {
                namespace,
                service,
                host,
                path,
            } => {
                let ports = self
                    .bounded(
                        "service ports",
                        self.orchestrator.service_ports(namespace, service),
                    )
                    .await?;
                let node_port = ports.iter().find_map(|p| p.node_port).ok_or_else(|| {
                    KubeError::NotFound {
                        resource: format!("nodePort on service/{}", service),
                    }
                })?;
                self.http_ok(&format!("http://{}:{}{}", host, node_port, path))
                    .await
            }
            ApplicationProbe::InCluster { workload, port, path } => {
                let pod = self
                    .bounded("find pod", self.orchestrator.find_pod(workload))
                    .await?
                    .ok_or_else(|| KubeError::NotFound {
                        resource: workload.display_name(),
                    })?;

                let output = self
                    .bounded(
                        "in-cluster probe",
                        self.orchestrator
                            .exec(workload.namespace(), &pod, &in_cluster_command(*port, path)),
                    )
                    .await?;

                if output.success {
                    Ok(())
                } else {
                    Err(KubeError::CommandFailed {
                        command: format!("in-cluster probe on {}", pod),
                        stderr: output.stderr.trim().to_string(),
                    })
                }
            }
        }
    }

    async fn http_ok(&self, url: &str) -> Result<(), KubeError> {
        match self.http.status(url).await {
            Ok(status) if (200..300).contains(&status) => Ok(()),
            Ok(status) => Err(KubeError::CommandFailed {
                command: format!("GET {}", url),
                stderr: format!("status {}", status),
            }),
            Err(e) => Err(KubeError::CommandFailed {
                command: format!("GET {}", url),
                stderr: e.to_string(),
            }),
        }
    }
}

/// Shell command that fetches the health path from inside a pod
fn in_cluster_command(port: u16, path: &str) -> Vec<String> {
    let url = format!("http://127.0.0.1:{}{}", port, path);
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "wget -q -O /dev/null {url} || curl -fsS -o /dev/null {url}",
            url = url
        ),
    ]
}

/// NotFound and transient failures become outcomes; only fatal errors escape
fn absorb(error: KubeError) -> Result<CheckOutcome, KubeError> {
    if error.is_fatal() {
        Err(error)
    } else if error.is_not_found() {
        Ok(CheckOutcome::NotCreated)
    } else {
        Ok(CheckOutcome::Unavailable(error.to_string()))
    }
}
