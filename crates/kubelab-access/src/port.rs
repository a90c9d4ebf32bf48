//! Local port inspection
//!
//! Answers three questions about a local port: is something bound to it,
//! which process holds it, and is a forwarding process already running for
//! it. Every external lookup runs under a timeout and any failure reads as
//! "unknown" rather than an error.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use kubelab_proto::FORWARDER_SIGNATURE;
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::debug;

/// Default timeout for `lsof` / `ps`
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait PortProbe: Send + Sync {
    /// A loopback bind on `port` fails because the address is taken
    async fn port_in_use(&self, port: u16) -> bool;

    /// PID of the process listening on `port`
    async fn occupant(&self, port: u16) -> Option<u32>;

    /// PID of a running forwarder whose command line maps `port`
    async fn find_forwarding_process(&self, port: u16) -> Option<u32>;

    /// Command line of a running process, arguments joined by spaces
    async fn command_line(&self, pid: u32) -> Option<String>;
}

/// True if `cmdline` is a forwarder for local `port`
pub fn matches_forwarder(cmdline: &str, port: u16) -> bool {
    let token = format!("{}:", port);
    cmdline.contains(FORWARDER_SIGNATURE)
        && cmdline
            .split_whitespace()
            .any(|arg| arg.starts_with(&token))
}

/// Inodes of sockets listening on `port` in a `/proc/net/tcp{,6}` table
pub fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?;

            let (_, hex_port) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(hex_port, 16).ok()?;

            if local_port == port && *state == TCP_LISTEN {
                inode.parse().ok().filter(|&i| i != 0)
            } else {
                None
            }
        })
        .collect()
}

/// Port probe backed by the host's process table
#[derive(Debug, Clone)]
pub struct SystemPortProbe {
    timeout: Duration,
}

impl SystemPortProbe {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a lookup command; `None` if it is missing, fails or times out
    async fn lookup(&self, program: &str, args: &[&str]) -> Option<String> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                debug!(program = %program, error = %e, "lookup command unavailable");
                return None;
            }
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            Ok(Err(e)) => {
                debug!(program = %program, error = %e, "lookup command failed");
                None
            }
            Err(_) => {
                debug!(program = %program, "lookup command timed out");
                None
            }
        }
    }

    async fn occupant_from_lsof(&self, port: u16) -> Option<u32> {
        let filter = format!("-iTCP:{}", port);
        let output = self
            .lookup("lsof", &["-t", &filter, "-sTCP:LISTEN"])
            .await?;
        output.lines().find_map(|line| line.trim().parse().ok())
    }
}

impl Default for SystemPortProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortProbe for SystemPortProbe {
    async fn port_in_use(&self, port: u16) -> bool {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(_) => false,
            Err(e) => e.kind() == ErrorKind::AddrInUse,
        }
    }

    async fn occupant(&self, port: u16) -> Option<u32> {
        if let Some(pid) = self.occupant_from_lsof(port).await {
            return Some(pid);
        }
        self.occupant_from_table(port).await
    }

    async fn find_forwarding_process(&self, port: u16) -> Option<u32> {
        self.scan_for_forwarder(port, std::process::id()).await
    }

    async fn command_line(&self, pid: u32) -> Option<String> {
        self.read_command_line(pid).await
    }
}

#[cfg(target_os = "linux")]
impl SystemPortProbe {
    /// Run a `/proc` scan on the blocking pool, giving up after the lookup timeout
    async fn blocking_lookup<T, F>(&self, scan: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Option<T> + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(scan)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                debug!(error = %e, "process table scan failed");
                None
            }
            Err(_) => {
                debug!(timeout = ?self.timeout, "process table scan timed out");
                None
            }
        }
    }

    async fn occupant_from_table(&self, port: u16) -> Option<u32> {
        self.blocking_lookup(move || procfs::occupant(port)).await
    }

    async fn scan_for_forwarder(&self, port: u16, own_pid: u32) -> Option<u32> {
        self.blocking_lookup(move || procfs::find_forwarder(port, own_pid))
            .await
    }

    async fn read_command_line(&self, pid: u32) -> Option<String> {
        self.blocking_lookup(move || procfs::command_line(pid)).await
    }
}

#[cfg(not(target_os = "linux"))]
impl SystemPortProbe {
    async fn occupant_from_table(&self, _port: u16) -> Option<u32> {
        None
    }

    async fn scan_for_forwarder(&self, port: u16, own_pid: u32) -> Option<u32> {
        let output = self.lookup("ps", &["-axo", "pid=,command="]).await?;
        output.lines().find_map(|line| {
            let (pid, command) = line.trim().split_once(char::is_whitespace)?;
            let pid: u32 = pid.parse().ok()?;
            (pid != own_pid && matches_forwarder(command, port)).then_some(pid)
        })
    }

    async fn read_command_line(&self, pid: u32) -> Option<String> {
        let pid = pid.to_string();
        let output = self.lookup("ps", &["-p", &pid, "-o", "command="]).await?;
        let command = output.trim();
        (!command.is_empty()).then(|| command.to_string())
    }
}

#[cfg(target_os = "linux")]
mod procfs {
    use std::fs;
    use std::path::Path;

    use super::{listening_inodes, matches_forwarder};

    fn pids() -> impl Iterator<Item = u32> {
        fs::read_dir("/proc")
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
    }

    pub fn occupant(port: u16) -> Option<u32> {
        let inodes: Vec<u64> = ["/proc/net/tcp", "/proc/net/tcp6"]
            .iter()
            .filter_map(|table| fs::read_to_string(table).ok())
            .flat_map(|table| listening_inodes(&table, port))
            .collect();

        if inodes.is_empty() {
            return None;
        }

        let wanted: Vec<String> = inodes.iter().map(|i| format!("socket:[{}]", i)).collect();

        pids().find(|pid| {
            let fd_dir = Path::new("/proc").join(pid.to_string()).join("fd");
            fs::read_dir(fd_dir)
                .into_iter()
                .flatten()
                .flatten()
                .filter_map(|fd| fs::read_link(fd.path()).ok())
                .any(|target| wanted.iter().any(|w| target.as_os_str() == w.as_str()))
        })
    }

    pub fn command_line(pid: u32) -> Option<String> {
        let raw = fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
        let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
        let cmdline = cmdline.trim();
        (!cmdline.is_empty()).then(|| cmdline.to_string())
    }

    pub fn find_forwarder(port: u16, own_pid: u32) -> Option<u32> {
        pids()
            .filter(|&pid| pid != own_pid)
            .find(|&pid| command_line(pid).map_or(false, |cmd| matches_forwarder(&cmd, port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_forwarder() {
        let cmd = "kubectl port-forward -n lab svc/backend 8080:80 --address 127.0.0.1";
        assert!(matches_forwarder(cmd, 8080));
        assert!(!matches_forwarder(cmd, 80));
        assert!(!matches_forwarder(cmd, 808));
        assert!(!matches_forwarder("python3 -m http.server 8080", 8080));
    }

    #[test]
    fn test_listening_inodes() {
        let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 4711 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 4712 1 0000000000000000 20 4 30 10 -1
   2: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 99 1 0000000000000000 100 0 0 10 0
";
        assert_eq!(listening_inodes(table, 8080), vec![4711]);
        assert_eq!(listening_inodes(table, 22), vec![99]);
        assert!(listening_inodes(table, 9090).is_empty());
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let probe = SystemPortProbe::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(probe.port_in_use(port).await);
        drop(listener);
        assert!(!probe.port_in_use(port).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_occupant_finds_own_listener() {
        let probe = SystemPortProbe::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert_eq!(probe.occupant(port).await, Some(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_slow_scan_is_abandoned() {
        let probe = SystemPortProbe::new().with_timeout(Duration::from_millis(20));

        let found = probe
            .blocking_lookup(|| {
                std::thread::sleep(Duration::from_millis(300));
                Some(1u32)
            })
            .await;
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_command_line_of_own_process() {
        let probe = SystemPortProbe::new();
        let own = probe.command_line(std::process::id()).await;
        assert!(own.map_or(false, |cmd| !cmd.is_empty()));
        assert_eq!(probe.command_line(u32::MAX).await, None);
    }
}
