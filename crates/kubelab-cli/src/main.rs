//! Kubelab CLI - wait for lab workloads and reach them from localhost

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kubelab_access::{AccessReport, AccessSupervisor};
use kubelab_cli::config::{Overrides, ProjectConfig, Settings, CONFIG_FILE_NAMES};
use kubelab_cli::output::{phase_label, Output};
use kubelab_cli::progress::{with_readiness_progress, with_spinner};
use kubelab_kube::{Kubectl, Orchestrator};
use kubelab_proto::{ForwardMapping, WorkloadKind, WorkloadRef};
use kubelab_readiness::{ComponentHealthChecker, PollerConfig, ReadinessPoller, ReadinessReport};

/// Kubelab - readiness and local access for lab clusters
#[derive(Parser, Debug)]
#[command(name = "kubelab")]
#[command(about = "Wait for lab workloads and forward them to localhost", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project config file (default: discover .kubelab.yml upwards)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Default namespace
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Kube context
    #[arg(long, global = true, env = "KUBELAB_CONTEXT")]
    context: Option<String>,

    /// kubectl binary
    #[arg(long, global = true, env = "KUBELAB_KUBECTL")]
    kubectl: Option<String>,

    /// State directory for PID files and forwarder logs (default: ~/.kubelab)
    #[arg(long, global = true, env = "KUBELAB_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Disable the progress spinner
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait until workloads are ready and the application answers
    Wait {
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Workload as kind/name (e.g. deployment/backend); repeatable
        #[arg(long = "workload")]
        workloads: Vec<String>,
        /// Label selector of a workload's pods; repeatable
        #[arg(long = "selector")]
        selectors: Vec<String>,
    },
    /// Establish local port forwards
    Forward {
        /// Mapping as role:local_port:[namespace/]service:remote_port; repeatable
        #[arg(long = "map")]
        maps: Vec<String>,
    },
    /// Wait for readiness, then forward, then print URLs
    Up {
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Stop recorded forwarders (all when no role is given)
    Stop {
        roles: Vec<String>,
    },
    /// Show recorded forwarders
    Status,
    /// Show allocatable node resources
    Nodes,
    /// Write a .kubelab.yml template to the current directory
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Warning: {:#}", e);
    }

    let output = Output::new(cli.json);
    if let Err(e) = run(cli, output).await {
        output.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: Output) -> Result<()> {
    let progress =
        !cli.no_progress && !cli.json && console::Term::stderr().is_term();

    if let Commands::Init { force } = &cli.command {
        return init(*force, output);
    }

    let settings = load_settings(&cli)?;

    match cli.command {
        Commands::Wait {
            timeout,
            workloads,
            selectors,
        } => {
            let mut targets = parse_workloads(&workloads, &selectors, &settings.namespace)?;
            if targets.is_empty() {
                targets = settings.workloads.clone();
            }
            let report = wait(&settings, &targets, timeout, progress).await?;
            print_readiness(output, &report);
        }
        Commands::Forward { maps } => {
            let mappings = if maps.is_empty() {
                settings.forwards.clone()
            } else {
                parse_mappings(&maps, &settings.namespace)?
            };
            let report = forward(&settings, &mappings, progress).await?;
            print_access(output, &report)?;
        }
        Commands::Up { timeout } => {
            let readiness = wait(&settings, &settings.workloads, timeout, progress).await?;
            print_readiness(output, &readiness);

            let report = forward(&settings, &settings.forwards, progress).await?;
            print_access(output, &report)?;

            if !output.is_json() {
                output.header("Lab is up");
                for record in report.records.values() {
                    output.kv(record.mapping.role(), &record.mapping.local_url());
                }
            }
        }
        Commands::Stop { roles } => {
            let report = supervisor(&settings).stop(&roles).await?;
            if output.is_json() {
                output.json(&report);
            } else {
                for stopped in &report.stopped {
                    if stopped.stale {
                        output.warn(&format!(
                            "Forgot {} (pid {} now belongs to another process, left running)",
                            stopped.role, stopped.pid
                        ));
                        continue;
                    }
                    let note = if stopped.was_running { "" } else { " (already exited)" };
                    output.success(&format!(
                        "Stopped {} (pid {}){}",
                        stopped.role, stopped.pid, note
                    ));
                }
                for role in &report.missing {
                    output.warn(&format!("No forwarder recorded for '{}'", role));
                }
                if report.stopped.is_empty() && report.missing.is_empty() {
                    output.info("No forwarders recorded");
                }
            }
        }
        Commands::Status => {
            let status = supervisor(&settings).status().await?;
            if output.is_json() {
                output.json(&status);
            } else if status.is_empty() {
                output.info("No forwarders recorded");
            } else {
                let widths = [16, 8, 8];
                output.table_row(&["ROLE", "PID", "STATE"], &widths);
                for entry in &status {
                    let state = if entry.alive { "running" } else { "exited" };
                    output.table_row(&[&entry.role, &entry.pid.to_string(), state], &widths);
                }
            }
        }
        Commands::Nodes => {
            let nodes = kubectl(&settings)
                .node_resources()
                .await
                .context("Failed to query node resources")?;
            if output.is_json() {
                output.json(&nodes);
            } else {
                let widths = [32, 8, 14, 6];
                output.table_row(&["NAME", "CPU", "MEMORY", "PODS"], &widths);
                for node in &nodes {
                    output.table_row(
                        &[
                            &node.name,
                            node.cpu.as_deref().unwrap_or("-"),
                            node.memory.as_deref().unwrap_or("-"),
                            node.pods.as_deref().unwrap_or("-"),
                        ],
                        &widths,
                    );
                }
            }
        }
        Commands::Init { .. } => {}
    }

    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let config = match &cli.config {
        Some(path) => ProjectConfig::load(path)?,
        None => match ProjectConfig::discover()? {
            Some((path, config)) => {
                debug!(path = %path.display(), "using project config");
                config
            }
            None => ProjectConfig::default(),
        },
    };

    config.resolve(&Overrides {
        namespace: cli.namespace.clone(),
        context: cli.context.clone(),
        kubectl: cli.kubectl.clone(),
        state_dir: cli.state_dir.clone(),
    })
}

fn parse_workloads(
    workloads: &[String],
    selectors: &[String],
    namespace: &str,
) -> Result<Vec<WorkloadRef>> {
    let mut targets = Vec::new();

    for spec in workloads {
        let (kind, name) = spec
            .split_once('/')
            .with_context(|| format!("Invalid workload '{}': expected kind/name", spec))?;
        let kind: WorkloadKind = kind.parse().map_err(anyhow::Error::msg)?;
        targets.push(WorkloadRef::named(namespace, name, kind));
    }

    for selector in selectors {
        targets.push(WorkloadRef::selector(
            namespace,
            selector.as_str(),
            WorkloadKind::Deployment,
        ));
    }

    Ok(targets)
}

fn parse_mappings(maps: &[String], namespace: &str) -> Result<Vec<ForwardMapping>> {
    maps.iter()
        .map(|spec| {
            ForwardMapping::parse(spec, namespace)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid mapping '{}'", spec))
        })
        .collect()
}

fn kubectl(settings: &Settings) -> Kubectl {
    Kubectl::new(&settings.kubectl)
        .with_context(settings.context.clone())
        .with_kubeconfig(settings.kubeconfig.clone())
        .with_timeout(settings.probe_timeout)
}

fn supervisor(settings: &Settings) -> AccessSupervisor {
    let kubectl = kubectl(settings);
    AccessSupervisor::new(kubectl.clone(), Arc::new(kubectl), &settings.state_dir)
        .with_policy(settings.verify)
}

async fn wait(
    settings: &Settings,
    workloads: &[WorkloadRef],
    timeout: Option<u64>,
    progress: bool,
) -> Result<ReadinessReport> {
    if workloads.is_empty() {
        anyhow::bail!(
            "No workloads to wait for: add `workloads` to {} or pass --workload/--selector",
            CONFIG_FILE_NAMES[0]
        );
    }

    let config = PollerConfig {
        timeout: timeout
            .map(Duration::from_secs)
            .unwrap_or(settings.poller.timeout),
        ..settings.poller
    };

    let checker = ComponentHealthChecker::new(Arc::new(kubectl(settings)))
        .with_probes(settings.probes.clone())
        .with_probe_timeout(settings.probe_timeout);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let poller = ReadinessPoller::new(checker, config).with_events(events_tx);

    let report = with_readiness_progress(events_rx, progress, poller.wait(workloads))
    .await?;

    Ok(report)
}

async fn forward(
    settings: &Settings,
    mappings: &[ForwardMapping],
    progress: bool,
) -> Result<AccessReport> {
    if mappings.is_empty() {
        anyhow::bail!(
            "No forwards configured: add `forwards` to {} or pass --map",
            CONFIG_FILE_NAMES[0]
        );
    }

    let supervisor = supervisor(settings);
    let report = with_spinner(
        "Establishing port forwards",
        progress,
        supervisor.establish(mappings),
    )
    .await
    .map_err(|e| {
        let running: Vec<String> = e
            .report()
            .map(|report| {
                report
                    .records
                    .values()
                    .map(|record| format!("{} (pid {})", record.mapping.role(), record.pid))
                    .collect()
            })
            .unwrap_or_default();

        if running.is_empty() {
            anyhow::Error::new(e)
        } else {
            anyhow::Error::new(e).context(format!(
                "Port forwarding aborted, still running: {}",
                running.join(", ")
            ))
        }
    })?;

    Ok(report)
}

fn print_readiness(output: Output, report: &ReadinessReport) {
    if output.is_json() {
        output.json(report);
        return;
    }

    output.header("Components");
    let widths = [40, 10];
    for status in &report.workloads {
        output.table_row(
            &[
                &status.workload.to_string(),
                &phase_label(status.state.phase),
                &status.state.last_message,
            ],
            &widths,
        );
    }
    output.success(&format!(
        "All components ready in {}s ({})",
        report.elapsed.as_secs(),
        report.application.message
    ));
}

fn print_access(output: Output, report: &AccessReport) -> Result<()> {
    if output.is_json() {
        let failures: Vec<String> = report.failures.iter().map(|f| f.to_string()).collect();
        output.json(&serde_json::json!({
            "records": report.records,
            "failures": failures,
        }));
    } else {
        for record in report.records.values() {
            output.success(&format!(
                "{} -> {} (pid {}, {})",
                record.mapping,
                record.mapping.local_url(),
                record.pid,
                record.strategy
            ));
        }
    }

    for failure in &report.failures {
        output.warn(&failure.to_string());
    }

    if report.records.is_empty() && !report.failures.is_empty() {
        anyhow::bail!("No forward could be established");
    }

    Ok(())
}

fn init(force: bool, output: Output) -> Result<()> {
    let path = std::env::current_dir()?.join(CONFIG_FILE_NAMES[0]);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    std::fs::write(&path, ProjectConfig::template())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    output.success(&format!("Wrote {}", path.display()));
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
