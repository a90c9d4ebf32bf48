//! `kubectl`-backed orchestrator

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use kubelab_proto::{PodPhase, WorkloadKind, WorkloadRef, WorkloadTarget};
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::KubeError;
use crate::nodes::{parse_describe_nodes, NodeResources};
use crate::orchestrator::{ExecOutput, Orchestrator, ServicePort};
use crate::resources::{select_pod, Controller, List, Node, Pod, Service};

/// Default timeout for a single kubectl invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Program and arguments of a port-forward process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl std::fmt::Display for PortForwardCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program.display(), self.args.join(" "))
    }
}

/// Orchestrator that shells out to `kubectl`
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: PathBuf,
    context: Option<String>,
    kubeconfig: Option<PathBuf>,
    timeout: Duration,
}

impl Kubectl {
    /// Create a client for the given kubectl binary
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            context: None,
            kubeconfig: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Use a specific kubeconfig context
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// Use a specific kubeconfig file
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    /// Set per-command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(context) = &self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.display().to_string());
        }
        args
    }

    /// Build the command line of a port-forward to `resource` (e.g. `svc/backend`)
    pub fn port_forward(
        &self,
        namespace: &str,
        resource: &str,
        local_port: u16,
        remote_port: u16,
    ) -> PortForwardCommand {
        let mut args = self.global_args();
        args.extend([
            "port-forward".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            resource.to_string(),
            format!("{}:{}", local_port, remote_port),
            "--address".to_string(),
            "127.0.0.1".to_string(),
        ]);

        PortForwardCommand {
            program: self.binary.clone(),
            args,
        }
    }

    /// Run kubectl with a timeout and return its output
    async fn output(&self, args: &[String]) -> Result<std::process::Output, KubeError> {
        let mut full_args = self.global_args();
        full_args.extend(args.iter().cloned());
        let command_line = format!("kubectl {}", args.join(" "));

        debug!(command = %command_line, "running orchestration command");

        let child = Command::new(&self.binary)
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    KubeError::BinaryNotFound {
                        binary: self.binary.display().to_string(),
                    }
                } else {
                    KubeError::Spawn {
                        binary: self.binary.display().to_string(),
                        source: e,
                    }
                }
            })?;

        tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| KubeError::Timeout {
                command: command_line.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| KubeError::CommandFailed {
                command: command_line,
                stderr: e.to_string(),
            })
    }

    /// Run kubectl and return stdout, mapping failures to typed errors
    async fn run(&self, args: &[String], resource: &str) -> Result<String, KubeError> {
        let output = self.output(args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            if is_not_found(&stderr) {
                return Err(KubeError::NotFound {
                    resource: resource.to_string(),
                });
            }
            return Err(KubeError::CommandFailed {
                command: format!("kubectl {}", args.join(" ")),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        args: &[String],
        resource: &str,
    ) -> Result<T, KubeError> {
        let stdout = self.run(args, resource).await?;
        serde_json::from_str(&stdout).map_err(|e| KubeError::InvalidOutput {
            command: format!("kubectl {}", args.join(" ")),
            reason: e.to_string(),
        })
    }

    async fn get_pod(&self, namespace: &str, pod: &str) -> Result<Pod, KubeError> {
        self.get_json(
            &args(&["get", "pod", pod, "-n", namespace, "-o", "json"]),
            &format!("pod/{}", pod),
        )
        .await
    }

    async fn pods_by_selector(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<String>, KubeError> {
        let list: List<Pod> = self
            .get_json(
                &args(&["get", "pods", "-n", namespace, "-l", selector, "-o", "json"]),
                &format!("pods[{}]", selector),
            )
            .await?;
        Ok(select_pod(&list.items))
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("NotFound") || stderr.contains("not found")
}

/// Absorb NotFound into `None`
fn optional<T>(result: Result<T, KubeError>) -> Result<Option<T>, KubeError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Orchestrator for Kubectl {
    async fn find_pod(&self, workload: &WorkloadRef) -> Result<Option<String>, KubeError> {
        let namespace = workload.namespace();

        match (workload.target(), workload.kind()) {
            (WorkloadTarget::Selector(selector), _) => {
                self.pods_by_selector(namespace, selector).await
            }
            (WorkloadTarget::Name(name), WorkloadKind::Pod) => {
                let pod = optional(self.get_pod(namespace, name).await)?;
                Ok(pod.filter(|p| !p.is_terminating()).map(|p| p.metadata.name))
            }
            (WorkloadTarget::Name(name), kind) => {
                let resource = format!("{}/{}", kind.resource(), name);
                let controller: Option<Controller> = optional(
                    self.get_json(
                        &args(&["get", kind.resource(), name, "-n", namespace, "-o", "json"]),
                        &resource,
                    )
                    .await,
                )?;

                let Some(controller) = controller else {
                    return Ok(None);
                };

                match controller.selector() {
                    Some(selector) => self.pods_by_selector(namespace, &selector).await,
                    None => Err(KubeError::InvalidOutput {
                        command: format!("kubectl get {}", resource),
                        reason: "controller has no matchLabels selector".to_string(),
                    }),
                }
            }
        }
    }

    async fn pod_phase(&self, namespace: &str, pod: &str) -> Result<PodPhase, KubeError> {
        Ok(self.get_pod(namespace, pod).await?.phase())
    }

    async fn pod_ready(&self, namespace: &str, pod: &str) -> Result<bool, KubeError> {
        Ok(self.get_pod(namespace, pod).await?.is_ready())
    }

    async fn service_ports(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<ServicePort>, KubeError> {
        let svc: Service = self
            .get_json(
                &args(&["get", "service", service, "-n", namespace, "-o", "json"]),
                &format!("service/{}", service),
            )
            .await?;
        Ok(svc.spec.ports.into_iter().map(Into::into).collect())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput, KubeError> {
        let mut exec_args = args(&["exec", "-n", namespace, pod, "--"]);
        exec_args.extend(command.iter().cloned());

        let output = self.output(&exec_args).await?;
        Ok(ExecOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn node_resources(&self) -> Result<Vec<NodeResources>, KubeError> {
        let structured: Result<List<Node>, KubeError> = self
            .get_json(&args(&["get", "nodes", "-o", "json"]), "nodes")
            .await;

        match structured {
            Ok(list) => Ok(list.items.into_iter().map(Into::into).collect()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "structured node query failed, falling back to describe output");
                let text = self
                    .run(&args(&["describe", "nodes"]), "nodes")
                    .await?;
                Ok(parse_describe_nodes(&text))
            }
        }
    }
}
