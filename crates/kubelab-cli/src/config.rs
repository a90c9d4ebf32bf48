//! Project-level configuration file support
//!
//! A `.kubelab.yml` next to the lab's manifests names the workloads to wait
//! for, the local forwards to bring up and how to probe the application.
//! It is discovered by walking up from the current directory.

use anyhow::{Context, Result};
use kubelab_access::{default_state_dir, ProcessRegistry, VerifyPolicy};
use kubelab_proto::{ForwardMapping, WorkloadKind, WorkloadRef, DEFAULT_HEALTH_PATH};
use kubelab_readiness::{ApplicationProbe, PollerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file names, in lookup order
pub const CONFIG_FILE_NAMES: [&str; 2] = [".kubelab.yml", ".kubelab.yaml"];

/// Project-level configuration file format
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub defaults: ProjectDefaults,

    /// Workloads the readiness poller waits for
    #[serde(default)]
    pub workloads: Vec<ProjectWorkload>,

    /// Local port forwards
    #[serde(default)]
    pub forwards: Vec<ProjectForward>,

    /// Application probes, tried in order url, node_port, in_cluster
    #[serde(default)]
    pub health: ProjectHealth,
}

/// Settings shared by every workload and forward
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDefaults {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Orchestration tool binary
    pub kubectl: Option<String>,

    /// Kube context (supports ${ENV_VAR} expansion)
    pub context: Option<String>,

    /// Kubeconfig path (supports ${ENV_VAR} expansion)
    pub kubeconfig: Option<String>,

    /// Overall readiness budget
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Delay between readiness iterations
    #[serde(default = "default_interval")]
    pub interval_millis: u64,

    /// Timeout of every single probe or cluster query
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,

    /// Wait after launching a forwarder before verifying it
    #[serde(default = "default_settle")]
    pub settle_millis: u64,

    #[serde(default = "default_primary_attempts")]
    pub primary_attempts: u32,

    #[serde(default = "default_secondary_attempts")]
    pub secondary_attempts: u32,

    /// Health path used by probes that do not set their own
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Where PID files and forwarder logs live (default ~/.kubelab)
    pub state_dir: Option<String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_timeout() -> u64 {
    300
}

fn default_interval() -> u64 {
    500
}

fn default_probe_timeout() -> u64 {
    2
}

fn default_settle() -> u64 {
    2000
}

fn default_primary_attempts() -> u32 {
    5
}

fn default_secondary_attempts() -> u32 {
    3
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

impl Default for ProjectDefaults {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kubectl: None,
            context: None,
            kubeconfig: None,
            timeout_seconds: default_timeout(),
            interval_millis: default_interval(),
            probe_timeout_seconds: default_probe_timeout(),
            settle_millis: default_settle(),
            primary_attempts: default_primary_attempts(),
            secondary_attempts: default_secondary_attempts(),
            health_path: default_health_path(),
            state_dir: None,
        }
    }
}

/// A workload to wait for. Exactly one of the target fields must be set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectWorkload {
    /// Name used to reference the workload elsewhere in the file
    pub name: String,
    pub namespace: Option<String>,
    pub selector: Option<String>,
    pub deployment: Option<String>,
    pub statefulset: Option<String>,
    pub daemonset: Option<String>,
    pub pod: Option<String>,
}

/// A local forward
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectForward {
    pub role: String,
    pub local_port: u16,
    pub service: String,
    pub remote_port: u16,
    pub namespace: Option<String>,
    /// Controller to forward to when the Service cannot be used
    pub deployment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectHealth {
    /// URL to GET (supports ${ENV_VAR} expansion)
    pub url: Option<String>,
    pub node_port: Option<NodePortHealth>,
    pub in_cluster: Option<InClusterHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePortHealth {
    pub service: String,
    #[serde(default = "default_node_host")]
    pub host: String,
    pub namespace: Option<String>,
    pub path: Option<String>,
}

fn default_node_host() -> String {
    "localhost".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InClusterHealth {
    /// Name of an entry in `workloads`
    pub workload: String,
    pub port: u16,
    pub path: Option<String>,
}

/// Command-line and environment overrides applied on top of the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub namespace: Option<String>,
    pub context: Option<String>,
    pub kubectl: Option<String>,
    pub state_dir: Option<PathBuf>,
}

/// Fully resolved settings handed to the components
#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    pub kubectl: PathBuf,
    pub context: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub poller: PollerConfig,
    pub probe_timeout: Duration,
    pub verify: VerifyPolicy,
    pub workloads: Vec<WorkloadRef>,
    pub forwards: Vec<ForwardMapping>,
    pub probes: Vec<ApplicationProbe>,
}

impl ProjectConfig {
    /// Discover and load project config by walking up the directory tree
    pub fn discover() -> Result<Option<(PathBuf, Self)>> {
        let current_dir = std::env::current_dir()?;
        Self::discover_from(&current_dir)
    }

    /// Discover config starting from a specific directory
    pub fn discover_from(start_dir: &Path) -> Result<Option<(PathBuf, Self)>> {
        let mut current = start_dir.to_path_buf();

        loop {
            for name in CONFIG_FILE_NAMES {
                let path = current.join(name);
                if path.exists() {
                    let config = Self::load(&path)?;
                    return Ok(Some((path, config)));
                }
            }

            if !current.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: ProjectConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for workload in &self.workloads {
            if !names.insert(&workload.name) {
                anyhow::bail!("Duplicate workload name: {}", workload.name);
            }
            workload.target()?;
        }

        let mut roles = HashSet::new();
        let mut ports = HashSet::new();
        for forward in &self.forwards {
            ProcessRegistry::validate_role(&forward.role)?;
            if !roles.insert(&forward.role) {
                anyhow::bail!("Duplicate forward role: {}", forward.role);
            }
            if !ports.insert(forward.local_port) {
                anyhow::bail!(
                    "Local port {} is used by more than one forward",
                    forward.local_port
                );
            }
        }

        if let Some(in_cluster) = &self.health.in_cluster {
            if !names.contains(&in_cluster.workload) {
                anyhow::bail!(
                    "health.in_cluster refers to unknown workload '{}'",
                    in_cluster.workload
                );
            }
        }

        Ok(())
    }

    /// Combine the file with overrides into component settings
    pub fn resolve(&self, overrides: &Overrides) -> Result<Settings> {
        let defaults = &self.defaults;

        let namespace = overrides
            .namespace
            .clone()
            .unwrap_or_else(|| defaults.namespace.clone());

        let kubectl = overrides
            .kubectl
            .clone()
            .or_else(|| defaults.kubectl.as_deref().map(expand_env_vars))
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "kubectl".to_string());

        let context = overrides
            .context
            .clone()
            .or_else(|| defaults.context.as_deref().map(expand_env_vars))
            .filter(|c| !c.is_empty());

        let kubeconfig = defaults
            .kubeconfig
            .as_deref()
            .map(expand_env_vars)
            .filter(|k| !k.is_empty())
            .map(|k| expand_home(&k));

        let state_dir = match (&overrides.state_dir, &defaults.state_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) => expand_home(&expand_env_vars(dir)),
            (None, None) => default_state_dir()?,
        };

        let workloads = self
            .workloads
            .iter()
            .map(|w| w.to_workload_ref(&namespace))
            .collect::<Result<Vec<_>>>()?;

        let forwards = self
            .forwards
            .iter()
            .map(|f| f.to_mapping(&namespace))
            .collect();

        let probes = self.probes(&namespace, &workloads)?;

        Ok(Settings {
            kubectl: PathBuf::from(kubectl),
            context,
            kubeconfig,
            state_dir,
            poller: PollerConfig {
                interval: Duration::from_millis(defaults.interval_millis),
                timeout: Duration::from_secs(defaults.timeout_seconds),
            },
            probe_timeout: Duration::from_secs(defaults.probe_timeout_seconds),
            verify: VerifyPolicy {
                settle: Duration::from_millis(defaults.settle_millis),
                primary_attempts: defaults.primary_attempts,
                secondary_attempts: defaults.secondary_attempts,
                ..VerifyPolicy::default()
            },
            workloads,
            forwards,
            probes,
            namespace,
        })
    }

    fn probes(&self, namespace: &str, workloads: &[WorkloadRef]) -> Result<Vec<ApplicationProbe>> {
        let health_path = &self.defaults.health_path;
        let mut probes = Vec::new();

        if let Some(url) = &self.health.url {
            probes.push(ApplicationProbe::Http {
                url: expand_env_vars(url),
            });
        }

        if let Some(node_port) = &self.health.node_port {
            probes.push(ApplicationProbe::NodePort {
                namespace: node_port
                    .namespace
                    .clone()
                    .unwrap_or_else(|| namespace.to_string()),
                service: node_port.service.clone(),
                host: node_port.host.clone(),
                path: node_port.path.clone().unwrap_or_else(|| health_path.clone()),
            });
        }

        if let Some(in_cluster) = &self.health.in_cluster {
            let index = self
                .workloads
                .iter()
                .position(|w| w.name == in_cluster.workload)
                .with_context(|| format!("Unknown workload '{}'", in_cluster.workload))?;
            probes.push(ApplicationProbe::InCluster {
                workload: workloads[index].clone(),
                port: in_cluster.port,
                path: in_cluster.path.clone().unwrap_or_else(|| health_path.clone()),
            });
        }

        Ok(probes)
    }

    /// Generate a template config file content
    pub fn template() -> String {
        r#"# Kubelab Project Configuration

defaults:
  namespace: lab
  # context: "${KUBELAB_CONTEXT}"
  # kubectl: kubectl
  timeout_seconds: 300
  interval_millis: 500
  health_path: /health

workloads:
  - name: backend
    deployment: backend

  - name: frontend
    selector: app=frontend

forwards:
  - role: backend
    local_port: 8080
    service: backend
    remote_port: 80

  - role: frontend
    local_port: 3000
    service: frontend
    remote_port: 80

health:
  in_cluster:
    workload: backend
    port: 8080
  # url: "http://localhost:8080/health"
  # node_port:
  #   service: backend
  #   host: localhost
"#
        .to_string()
    }
}

impl ProjectWorkload {
    fn target(&self) -> Result<(WorkloadKind, Option<&str>, &str)> {
        let named = [
            (WorkloadKind::Deployment, self.deployment.as_deref()),
            (WorkloadKind::StatefulSet, self.statefulset.as_deref()),
            (WorkloadKind::DaemonSet, self.daemonset.as_deref()),
            (WorkloadKind::Pod, self.pod.as_deref()),
        ];

        let mut targets: Vec<(WorkloadKind, Option<&str>, &str)> = named
            .into_iter()
            .filter_map(|(kind, name)| name.map(|n| (kind, Some(n), n)))
            .collect();
        if let Some(selector) = self.selector.as_deref() {
            targets.push((WorkloadKind::Deployment, None, selector));
        }

        match targets.len() {
            1 => Ok(targets.remove(0)),
            0 => anyhow::bail!(
                "Workload '{}' needs one of selector, deployment, statefulset, daemonset or pod",
                self.name
            ),
            _ => anyhow::bail!("Workload '{}' sets more than one target", self.name),
        }
    }

    pub fn to_workload_ref(&self, default_namespace: &str) -> Result<WorkloadRef> {
        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| default_namespace.to_string());

        Ok(match self.target()? {
            (kind, Some(name), _) => WorkloadRef::named(namespace, name, kind),
            (kind, None, selector) => WorkloadRef::selector(namespace, selector, kind),
        })
    }
}

impl ProjectForward {
    pub fn to_mapping(&self, default_namespace: &str) -> ForwardMapping {
        let namespace = self.namespace.as_deref().unwrap_or(default_namespace);
        let mapping = ForwardMapping::new(
            &self.role,
            self.local_port,
            namespace,
            &self.service,
            self.remote_port,
        );
        match &self.deployment {
            Some(deployment) => mapping.with_deployment(deployment),
            None => mapping,
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Expand environment variables in a string
///
/// Supports `${VAR}` syntax. If the variable is not set, returns empty string.
pub fn expand_env_vars(input: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };

    re.replace_all(input, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelab_proto::WorkloadTarget;

    fn overrides() -> Overrides {
        Overrides {
            state_dir: Some(PathBuf::from("/tmp/kubelab-test")),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
workloads:
  - name: api
    deployment: api
"#;
        let config = ProjectConfig::parse(yaml).unwrap();
        assert_eq!(config.defaults.namespace, "default");
        assert_eq!(config.defaults.timeout_seconds, 300);
        assert_eq!(config.defaults.health_path, "/health");
        assert_eq!(config.workloads.len(), 1);
        assert!(config.forwards.is_empty());
    }

    #[test]
    fn test_template_is_valid() {
        let config = ProjectConfig::parse(&ProjectConfig::template()).unwrap();
        let settings = config.resolve(&overrides()).unwrap();

        assert_eq!(settings.namespace, "lab");
        assert_eq!(settings.workloads.len(), 2);
        assert_eq!(settings.forwards.len(), 2);
        assert_eq!(
            settings.probes,
            vec![ApplicationProbe::InCluster {
                workload: WorkloadRef::named("lab", "backend", WorkloadKind::Deployment),
                port: 8080,
                path: "/health".to_string(),
            }]
        );
    }

    #[test]
    fn test_duplicate_workload_name() {
        let yaml = r#"
workloads:
  - name: api
    deployment: api
  - name: api
    selector: app=api
"#;
        assert!(ProjectConfig::parse(yaml).is_err());
    }

    #[test]
    fn test_workload_needs_exactly_one_target() {
        let none = "workloads:\n  - name: api\n";
        assert!(ProjectConfig::parse(none).is_err());

        let two = "workloads:\n  - name: api\n    deployment: api\n    pod: api-0\n";
        assert!(ProjectConfig::parse(two).is_err());
    }

    #[test]
    fn test_duplicate_local_port() {
        let yaml = r#"
forwards:
  - role: backend
    local_port: 8080
    service: backend
    remote_port: 80
  - role: admin
    local_port: 8080
    service: admin
    remote_port: 80
"#;
        let err = ProjectConfig::parse(yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("8080"));
    }

    #[test]
    fn test_invalid_role() {
        let yaml = r#"
forwards:
  - role: "my backend"
    local_port: 8080
    service: backend
    remote_port: 80
"#;
        assert!(ProjectConfig::parse(yaml).is_err());
    }

    #[test]
    fn test_in_cluster_must_reference_workload() {
        let yaml = r#"
workloads:
  - name: api
    deployment: api
health:
  in_cluster:
    workload: web
    port: 80
"#;
        assert!(ProjectConfig::parse(yaml).is_err());
    }

    #[test]
    fn test_resolve_namespaces_and_overrides() {
        let yaml = r#"
defaults:
  namespace: lab
  context: kind-lab
workloads:
  - name: db
    namespace: data
    statefulset: postgres
  - name: web
    selector: app=web
forwards:
  - role: db
    local_port: 5432
    service: postgres
    namespace: data
    remote_port: 5432
    deployment: postgres-primary
"#;
        let config = ProjectConfig::parse(yaml).unwrap();
        let settings = config
            .resolve(&Overrides {
                namespace: Some("staging".to_string()),
                context: Some("kind-other".to_string()),
                ..overrides()
            })
            .unwrap();

        assert_eq!(settings.context.as_deref(), Some("kind-other"));
        assert_eq!(settings.workloads[0].namespace(), "data");
        assert_eq!(settings.workloads[0].kind(), WorkloadKind::StatefulSet);
        assert_eq!(settings.workloads[1].namespace(), "staging");
        assert_eq!(
            settings.workloads[1].target(),
            &WorkloadTarget::Selector("app=web".to_string())
        );
        assert_eq!(settings.forwards[0].remote_namespace(), "data");
        assert_eq!(settings.forwards[0].deployment(), "postgres-primary");
        assert_eq!(settings.state_dir, PathBuf::from("/tmp/kubelab-test"));
    }

    #[test]
    fn test_resolve_timing() {
        let yaml = r#"
defaults:
  timeout_seconds: 60
  interval_millis: 250
  settle_millis: 0
  secondary_attempts: 2
"#;
        let settings = ProjectConfig::parse(yaml)
            .unwrap()
            .resolve(&overrides())
            .unwrap();

        assert_eq!(settings.poller.timeout, Duration::from_secs(60));
        assert_eq!(settings.poller.interval, Duration::from_millis(250));
        assert_eq!(settings.verify.settle, Duration::ZERO);
        assert_eq!(settings.verify.primary_attempts, 5);
        assert_eq!(settings.verify.secondary_attempts, 2);
        assert_eq!(settings.kubectl, PathBuf::from("kubectl"));
        assert_eq!(settings.context, None);
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("KUBELAB_TEST_CONTEXT", "kind-lab");
        assert_eq!(expand_env_vars("${KUBELAB_TEST_CONTEXT}"), "kind-lab");
        assert_eq!(expand_env_vars("ctx-${KUBELAB_TEST_CONTEXT}-1"), "ctx-kind-lab-1");
        assert_eq!(expand_env_vars("${KUBELAB_TEST_UNSET_VAR}"), "");
        assert_eq!(expand_env_vars("plain"), "plain");
    }

    #[test]
    fn test_probe_order_and_default_path() {
        let yaml = r#"
defaults:
  health_path: /healthz
workloads:
  - name: api
    deployment: api
health:
  url: http://localhost:8080/ready
  node_port:
    service: api
  in_cluster:
    workload: api
    port: 9000
"#;
        let settings = ProjectConfig::parse(yaml)
            .unwrap()
            .resolve(&overrides())
            .unwrap();

        assert_eq!(settings.probes.len(), 3);
        assert!(matches!(&settings.probes[0], ApplicationProbe::Http { url } if url.ends_with("/ready")));
        assert!(matches!(
            &settings.probes[1],
            ApplicationProbe::NodePort { path, host, .. } if path == "/healthz" && host == "localhost"
        ));
        assert!(matches!(
            &settings.probes[2],
            ApplicationProbe::InCluster { port: 9000, path, .. } if path == "/healthz"
        ));
    }
}
