//! Access supervisor scenarios against a simulated host
//!
//! `FakeHost` plays process table, port table and HTTP endpoint at once.
//! Per-scenario rules decide whether a launched forwarder binds its local
//! port and answers (`serves`), dies right after launch (`exits`) or cannot
//! be started at all (`missing`).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kubelab_access::{
    matches_forwarder, AccessError, AccessSupervisor, DetachMode, Detacher, LaunchError,
    PortProbe, Verifier,
};
use kubelab_kube::{
    ExecOutput, KubeError, Kubectl, NodeResources, Orchestrator, PortForwardCommand, ProbeError,
    ServicePort, TargetPort,
};
use kubelab_proto::{ForwardMapping, PodPhase, Strategy, WorkloadRef};
use tempfile::TempDir;

type LaunchRule = Box<dyn Fn(&PortForwardCommand, &DetachMode) -> bool + Send + Sync>;

fn always() -> LaunchRule {
    Box::new(|_, _| true)
}

fn never() -> LaunchRule {
    Box::new(|_, _| false)
}

#[derive(Default)]
struct HostState {
    next_pid: u32,
    alive: HashSet<u32>,
    cmdlines: HashMap<u32, String>,
    listeners: HashMap<u16, u32>,
    healthy: HashSet<u16>,
    launches: Vec<(PortForwardCommand, DetachMode)>,
    terminated: Vec<u32>,
}

struct FakeHost {
    state: Mutex<HostState>,
    serves: LaunchRule,
    exits: LaunchRule,
    missing: LaunchRule,
}

impl FakeHost {
    fn host(serves: LaunchRule, exits: LaunchRule, missing: LaunchRule) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HostState {
                next_pid: 1000,
                ..Default::default()
            }),
            serves,
            exits,
            missing,
        })
    }

    fn new(serves: LaunchRule) -> Arc<Self> {
        Self::host(serves, never(), never())
    }

    fn always() -> Arc<Self> {
        Self::new(always())
    }

    /// Pre-existing process that holds no port
    fn run(&self, pid: u32, cmdline: &str) {
        let mut state = self.state.lock().unwrap();
        state.alive.insert(pid);
        state.cmdlines.insert(pid, cmdline.to_string());
    }

    /// Pre-existing process listening on `port`
    fn occupy(&self, pid: u32, port: u16, cmdline: &str, healthy: bool) {
        self.run(pid, cmdline);
        let mut state = self.state.lock().unwrap();
        state.listeners.insert(port, pid);
        if healthy {
            state.healthy.insert(port);
        }
    }

    fn launches(&self) -> Vec<(PortForwardCommand, DetachMode)> {
        self.state.lock().unwrap().launches.clone()
    }

    fn terminated(&self) -> Vec<u32> {
        self.state.lock().unwrap().terminated.clone()
    }

    fn is_running(&self, pid: u32) -> bool {
        self.state.lock().unwrap().alive.contains(&pid)
    }

    fn listener(&self, port: u16) -> Option<u32> {
        self.state.lock().unwrap().listeners.get(&port).copied()
    }
}

fn local_port(command: &PortForwardCommand) -> u16 {
    command
        .args
        .iter()
        .find_map(|arg| arg.split_once(':')?.0.parse().ok())
        .expect("port-forward command has a port mapping")
}

#[async_trait]
impl Detacher for FakeHost {
    fn detach(&self, command: &PortForwardCommand, mode: &DetachMode) -> Result<u32, LaunchError> {
        if (self.missing)(command, mode) {
            return Err(LaunchError::ProgramNotFound {
                program: command.program.display().to_string(),
            });
        }

        let exits = (self.exits)(command, mode);
        let serves = !exits && (self.serves)(command, mode);
        let mut state = self.state.lock().unwrap();
        state.next_pid += 1;
        let pid = state.next_pid;

        if !exits {
            state.alive.insert(pid);
        }
        state.cmdlines.insert(pid, command.to_string());
        state.launches.push((command.clone(), mode.clone()));

        let port = local_port(command);
        if serves && !state.listeners.contains_key(&port) {
            state.listeners.insert(port, pid);
            state.healthy.insert(port);
        }

        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.is_running(pid)
    }

    async fn terminate(&self, pid: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        state.alive.remove(&pid);
        state.terminated.push(pid);

        let ports: Vec<u16> = state
            .listeners
            .iter()
            .filter(|(_, &owner)| owner == pid)
            .map(|(&port, _)| port)
            .collect();
        for port in ports {
            state.listeners.remove(&port);
            state.healthy.remove(&port);
        }
        true
    }
}

#[async_trait]
impl PortProbe for FakeHost {
    async fn port_in_use(&self, port: u16) -> bool {
        self.listener(port).is_some()
    }

    async fn occupant(&self, port: u16) -> Option<u32> {
        self.listener(port)
    }

    async fn find_forwarding_process(&self, port: u16) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state
            .alive
            .iter()
            .copied()
            .find(|pid| {
                state
                    .cmdlines
                    .get(pid)
                    .map(|cmd| matches_forwarder(cmd, port))
                    .unwrap_or(false)
            })
    }

    async fn command_line(&self, pid: u32) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.alive.contains(&pid) {
            state.cmdlines.get(&pid).cloned()
        } else {
            None
        }
    }
}

#[async_trait]
impl Verifier for FakeHost {
    async fn verify(&self, port: u16) -> Result<(), ProbeError> {
        if self.state.lock().unwrap().healthy.contains(&port) {
            Ok(())
        } else {
            Err(ProbeError::ConnectionFailed {
                address: format!("127.0.0.1:{}", port),
                reason: "Connection refused".to_string(),
            })
        }
    }
}

/// Service `backend` exposes 80 -> container port 8080
struct FakeCluster;

#[async_trait]
impl Orchestrator for FakeCluster {
    async fn find_pod(&self, _workload: &WorkloadRef) -> Result<Option<String>, KubeError> {
        Ok(None)
    }

    async fn pod_phase(&self, _namespace: &str, _pod: &str) -> Result<PodPhase, KubeError> {
        Ok(PodPhase::Unknown)
    }

    async fn pod_ready(&self, _namespace: &str, _pod: &str) -> Result<bool, KubeError> {
        Ok(false)
    }

    async fn service_ports(
        &self,
        _namespace: &str,
        _service: &str,
    ) -> Result<Vec<ServicePort>, KubeError> {
        Ok(vec![ServicePort {
            name: Some("http".to_string()),
            port: 80,
            target_port: Some(TargetPort::Number(8080)),
            node_port: None,
        }])
    }

    async fn exec(
        &self,
        _namespace: &str,
        _pod: &str,
        _command: &[String],
    ) -> Result<ExecOutput, KubeError> {
        Ok(ExecOutput::default())
    }

    async fn node_resources(&self) -> Result<Vec<NodeResources>, KubeError> {
        Ok(Vec::new())
    }
}

fn supervisor(host: &Arc<FakeHost>, state_dir: &TempDir) -> AccessSupervisor {
    AccessSupervisor::new(Kubectl::new("kubectl"), Arc::new(FakeCluster), state_dir.path())
        .with_port_probe(host.clone())
        .with_detacher(host.clone())
        .with_verifier(host.clone())
}

fn backend() -> ForwardMapping {
    ForwardMapping::new("backend", 8080, "lab", "backend", 80)
}

fn frontend() -> ForwardMapping {
    ForwardMapping::new("frontend", 3000, "lab", "frontend", 80)
}

#[tokio::test(start_paused = true)]
async fn test_direct_service_success_is_recorded() {
    let host = FakeHost::always();
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let report = supervisor.establish(&[backend()]).await.unwrap();
    assert!(report.is_complete());

    let record = &report.records["backend"];
    assert_eq!(record.strategy, Strategy::DirectService);
    assert_eq!(host.listener(8080), Some(record.pid));
    assert_eq!(supervisor.registry().read("backend").unwrap(), Some(record.pid));

    let launches = host.launches();
    assert_eq!(launches.len(), 1);
    assert!(launches[0].0.args.contains(&"svc/backend".to_string()));
    assert!(launches[0].0.args.contains(&"8080:80".to_string()));
    assert_eq!(launches[0].1, DetachMode::Background);
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_occupant_is_terminated() {
    let host = FakeHost::always();
    host.occupy(4242, 8080, "python3 -m http.server 8080", false);
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let report = supervisor.establish(&[backend()]).await.unwrap();

    assert!(!host.is_running(4242));
    assert!(host.terminated().contains(&4242));
    let record = &report.records["backend"];
    assert_eq!(host.listener(8080), Some(record.pid));
    assert_ne!(record.pid, 4242);
}

#[tokio::test(start_paused = true)]
async fn test_second_establish_adopts_running_forwarder() {
    let host = FakeHost::always();
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let first = supervisor.establish(&[backend()]).await.unwrap();
    let second = supervisor.establish(&[backend()]).await.unwrap();

    assert_eq!(host.launches().len(), 1);
    assert_eq!(second.records["backend"].strategy, Strategy::Adopted);
    assert_eq!(second.records["backend"].pid, first.records["backend"].pid);
    assert!(host.terminated().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_forwarder_from_elsewhere_is_adopted() {
    let host = FakeHost::always();
    host.occupy(
        777,
        8080,
        "kubectl port-forward -n lab svc/backend 8080:80",
        true,
    );
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let report = supervisor.establish(&[backend()]).await.unwrap();

    assert_eq!(report.records["backend"].strategy, Strategy::Adopted);
    assert_eq!(report.records["backend"].pid, 777);
    assert!(host.launches().is_empty());
    assert_eq!(supervisor.registry().read("backend").unwrap(), Some(777));
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_deployment_target() {
    let host = FakeHost::new(Box::new(|command, _| {
        command.args.iter().any(|a| a.starts_with("deployment/"))
    }));
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let report = supervisor.establish(&[backend()]).await.unwrap();
    let record = &report.records["backend"];
    assert_eq!(record.strategy, Strategy::DeploymentTarget);

    let launches = host.launches();
    assert_eq!(launches.len(), 4);
    assert_eq!(launches[1].1, DetachMode::NewSession);
    assert!(matches!(launches[2].1, DetachMode::Released { .. }));

    let last = &launches[3].0;
    assert!(last.args.contains(&"deployment/backend".to_string()));
    assert!(last.args.contains(&"8080:8080".to_string()));

    // Only the winner survives.
    let survivors: Vec<u32> = (1001..=1004).filter(|&pid| host.is_running(pid)).collect();
    assert_eq!(survivors, vec![record.pid]);
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_reports_and_cleans_up() {
    let host = FakeHost::new(Box::new(|command, _| {
        command.args.contains(&"svc/frontend".to_string())
    }));
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let report = supervisor
        .establish(&[backend(), frontend()])
        .await
        .unwrap();

    assert!(!report.is_complete());
    assert!(report.records.contains_key("frontend"));
    assert!(!report.records.contains_key("backend"));

    let failure = &report.failures[0];
    assert_eq!(failure.mapping.role(), "backend");
    let strategies: Vec<Strategy> = failure.attempts.iter().map(|a| a.strategy).collect();
    assert_eq!(strategies, Strategy::CHAIN.to_vec());
    assert!(failure.attempts[0]
        .error
        .contains("not verified after 5 attempts"));

    let backend_pids: Vec<u32> = host
        .launches()
        .iter()
        .zip(1001..)
        .filter(|((command, _), _)| command.args.contains(&"svc/backend".to_string()))
        .map(|(_, pid)| pid)
        .collect();
    assert_eq!(backend_pids.len(), 3);
    assert!(backend_pids.iter().all(|&pid| !host.is_running(pid)));
    assert_eq!(supervisor.registry().read("backend").unwrap(), None);

    assert!(matches!(
        report.into_result(),
        Err(AccessError::PartialFailure { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_ports_are_rejected_before_launch() {
    let host = FakeHost::always();
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let clash = ForwardMapping::new("frontend", 8080, "lab", "frontend", 80);
    let err = supervisor.establish(&[backend(), clash]).await.unwrap_err();

    assert!(matches!(err, AccessError::InvalidMapping(_)));
    assert!(host.launches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_program_is_fatal() {
    let host = FakeHost::host(always(), never(), always());
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let err = supervisor
        .establish(&[backend(), frontend()])
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::Fatal { .. }));
    assert!(err.report().unwrap().records.is_empty());
    assert!(host.launches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_reports_established_forwards() {
    let host = FakeHost::host(
        always(),
        never(),
        Box::new(|command, _| command.args.contains(&"svc/frontend".to_string())),
    );
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let err = supervisor
        .establish(&[backend(), frontend()])
        .await
        .unwrap_err();

    let AccessError::Fatal { source, report } = &err else {
        panic!("expected a fatal error, got {:?}", err);
    };
    assert!(matches!(source, LaunchError::ProgramNotFound { .. }));

    let record = &report.records["backend"];
    assert_eq!(record.strategy, Strategy::DirectService);
    assert!(!report.records.contains_key("frontend"));
    assert!(host.is_running(record.pid));
    assert_eq!(supervisor.registry().read("backend").unwrap(), Some(record.pid));
}

#[tokio::test(start_paused = true)]
async fn test_reused_pid_in_registry_is_not_signalled() {
    let host = FakeHost::always();
    host.run(4242, "vim notes.txt");
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);
    supervisor.registry().record("backend", 4242);

    let report = supervisor.establish(&[backend()]).await.unwrap();

    let record = &report.records["backend"];
    assert_eq!(record.strategy, Strategy::DirectService);
    assert_ne!(record.pid, 4242);
    assert!(host.is_running(4242));
    assert!(!host.terminated().contains(&4242));
    assert_eq!(supervisor.registry().read("backend").unwrap(), Some(record.pid));
}

#[tokio::test(start_paused = true)]
async fn test_reused_pid_does_not_adopt_unrelated_listener() {
    let host = FakeHost::always();
    host.run(4242, "vim notes.txt");
    host.occupy(5151, 8080, "python3 -m http.server 8080", true);
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);
    supervisor.registry().record("backend", 4242);

    let report = supervisor.establish(&[backend()]).await.unwrap();

    let record = &report.records["backend"];
    assert_eq!(record.strategy, Strategy::DirectService);
    assert_ne!(record.pid, 4242);
    assert_ne!(record.pid, 5151);
    assert_eq!(host.listener(8080), Some(record.pid));
    assert_eq!(host.terminated(), vec![5151]);
    assert!(host.is_running(4242));
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_recorded_forwarder_is_replaced() {
    let host = FakeHost::always();
    host.occupy(
        777,
        8080,
        "kubectl port-forward -n lab svc/backend 8080:80",
        false,
    );
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);
    supervisor.registry().record("backend", 777);

    let report = supervisor.establish(&[backend()]).await.unwrap();

    let record = &report.records["backend"];
    assert_eq!(record.strategy, Strategy::DirectService);
    assert!(host.terminated().contains(&777));
    assert!(!host.is_running(777));
    assert_eq!(host.listener(8080), Some(record.pid));
    assert_eq!(supervisor.registry().read("backend").unwrap(), Some(record.pid));
}

#[tokio::test(start_paused = true)]
async fn test_forwarder_exiting_after_launch_fails_every_strategy() {
    let host = FakeHost::host(always(), always(), never());
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let report = supervisor.establish(&[backend()]).await.unwrap();

    assert!(report.records.is_empty());
    assert_eq!(host.launches().len(), 4);

    let failure = &report.failures[0];
    let errors: Vec<&str> = failure.attempts.iter().map(|a| a.error.as_str()).collect();
    assert_eq!(
        errors,
        vec![
            "process 1001 exited",
            "process 1002 exited",
            "process 1003 exited",
            "process 1004 exited",
        ]
    );
    assert_eq!(supervisor.registry().read("backend").unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_exited_background_forwarder_falls_through() {
    let host = FakeHost::host(
        always(),
        Box::new(|_, mode| *mode == DetachMode::Background),
        never(),
    );
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let report = supervisor.establish(&[backend()]).await.unwrap();

    let record = &report.records["backend"];
    assert_eq!(record.strategy, Strategy::Scripted);
    assert_eq!(record.pid, 1002);
    assert_eq!(host.launches().len(), 2);
    assert_eq!(host.listener(8080), Some(1002));
}

#[tokio::test(start_paused = true)]
async fn test_stop_terminates_and_forgets() {
    let host = FakeHost::always();
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);

    let report = supervisor
        .establish(&[backend(), frontend()])
        .await
        .unwrap();
    let backend_pid = report.records["backend"].pid;

    let stopped = supervisor
        .stop(&["backend".to_string(), "ghost".to_string()])
        .await
        .unwrap();
    assert_eq!(stopped.stopped.len(), 1);
    assert_eq!(stopped.stopped[0].pid, backend_pid);
    assert!(stopped.stopped[0].was_running);
    assert_eq!(stopped.missing, vec!["ghost".to_string()]);
    assert!(!host.is_running(backend_pid));

    let status = supervisor.status().await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].role, "frontend");
    assert!(status[0].alive);

    let rest = supervisor.stop(&[]).await.unwrap();
    assert_eq!(rest.stopped.len(), 1);
    assert!(supervisor.status().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_leaves_reused_pid_running() {
    let host = FakeHost::always();
    host.run(4242, "vim notes.txt");
    let state_dir = TempDir::new().unwrap();
    let supervisor = supervisor(&host, &state_dir);
    supervisor.registry().record("backend", 4242);

    let status = supervisor.status().await.unwrap();
    assert_eq!(status.len(), 1);
    assert!(!status[0].alive);

    let report = supervisor.stop(&["backend".to_string()]).await.unwrap();

    let stopped = &report.stopped[0];
    assert_eq!(stopped.pid, 4242);
    assert!(stopped.stale);
    assert!(!stopped.was_running);
    assert!(!stopped.terminated);
    assert!(host.is_running(4242));
    assert!(host.terminated().is_empty());
    assert_eq!(supervisor.registry().read("backend").unwrap(), None);
}
