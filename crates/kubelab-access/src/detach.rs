//! Background process launch and termination

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use kubelab_kube::PortForwardCommand;
use tracing::{debug, warn};

use crate::error::LaunchError;

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How a forwarder is detached from the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachMode {
    /// Own process group, output discarded
    Background,
    /// New session, so it survives the caller's terminal
    NewSession,
    /// Output appended to `log_path`
    Released { log_path: PathBuf },
}

/// Launches and controls detached processes
#[async_trait]
pub trait Detacher: Send + Sync {
    /// Start `command` detached and return its PID
    fn detach(&self, command: &PortForwardCommand, mode: &DetachMode) -> Result<u32, LaunchError>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Ask `pid` to exit, then force it. Returns true once it is gone.
    async fn terminate(&self, pid: u32) -> bool;
}

/// Detacher for the local operating system
///
/// Children started here are kept so they can be reaped; an exited child
/// would otherwise linger as a zombie and still look alive.
pub struct SystemDetacher {
    children: Mutex<HashMap<u32, Child>>,
    grace: Duration,
}

impl SystemDetacher {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Reap an owned child. `Some(alive)` if we own it, `None` otherwise.
    fn owned_child_alive(&self, pid: u32) -> Option<bool> {
        let mut children = self.children.lock().ok()?;
        let child = children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = pid, status = %status, "detached process exited");
                children.remove(&pid);
                Some(false)
            }
            Ok(None) => Some(true),
            Err(_) => None,
        }
    }
}

impl Default for SystemDetacher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn configure(command: &mut Command, mode: &DetachMode) {
    use std::os::unix::process::CommandExt;

    match mode {
        DetachMode::NewSession => unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        },
        DetachMode::Background | DetachMode::Released { .. } => {
            command.process_group(0);
        }
    }
}

#[cfg(windows)]
fn configure(command: &mut Command, _mode: &DetachMode) {
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(unix)]
fn pid_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks that the process exists and may be signalled.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(unix)]
fn signal(pid: u32, force: bool) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
    unsafe {
        libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn pid_exists(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(windows)]
fn signal(pid: u32, force: bool) {
    let mut args = vec!["/PID".to_string(), pid.to_string()];
    if force {
        args.push("/F".to_string());
    }
    let _ = Command::new("taskkill").args(&args).output();
}

#[async_trait]
impl Detacher for SystemDetacher {
    fn detach(&self, command: &PortForwardCommand, mode: &DetachMode) -> Result<u32, LaunchError> {
        let program = command.program.display().to_string();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let DetachMode::Released { log_path } = mode {
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent).map_err(|source| LaunchError::LogFile {
                    path: log_path.clone(),
                    source,
                })?;
            }
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .map_err(|source| LaunchError::LogFile {
                    path: log_path.clone(),
                    source,
                })?;
            let log_err = log.try_clone().map_err(|source| LaunchError::LogFile {
                path: log_path.clone(),
                source,
            })?;
            cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
        }

        configure(&mut cmd, mode);

        let child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LaunchError::ProgramNotFound {
                    program: program.clone(),
                }
            } else {
                LaunchError::Spawn {
                    program: program.clone(),
                    source,
                }
            }
        })?;

        let pid = child.id();
        debug!(pid = pid, mode = ?mode, command = %command, "launched detached process");

        if let Ok(mut children) = self.children.lock() {
            children.insert(pid, child);
        }

        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.owned_child_alive(pid)
            .unwrap_or_else(|| pid_exists(pid))
    }

    async fn terminate(&self, pid: u32) -> bool {
        if !self.is_alive(pid) {
            return true;
        }

        signal(pid, false);

        let interval = Duration::from_millis(100);
        let iterations = (self.grace.as_millis() / 100).max(1);
        for _ in 0..iterations {
            if !self.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(interval).await;
        }

        warn!(pid = pid, "process ignored SIGTERM, killing");
        signal(pid, true);
        tokio::time::sleep(interval).await;

        !self.is_alive(pid)
    }
}
