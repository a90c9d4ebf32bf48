//! Process registry
//!
//! Forwarders outlive the command that started them, so the only durable
//! handle is a `<role>.pid` file under `~/.kubelab/pids/`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::RegistryError;

/// Per-user state directory (`~/.kubelab`)
pub fn default_state_dir() -> Result<PathBuf, RegistryError> {
    let home = dirs::home_dir().ok_or(RegistryError::NoHomeDir)?;
    Ok(home.join(".kubelab"))
}

/// Role to PID mapping persisted as one file per role
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    dir: PathBuf,
}

impl ProcessRegistry {
    /// Registry under `<state_dir>/pids`
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("pids"),
        }
    }

    /// Registry rooted directly at `dir`
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Validate role name (alphanumeric, hyphens, underscores only)
    pub fn validate_role(role: &str) -> Result<(), RegistryError> {
        if role.is_empty()
            || !role
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(RegistryError::InvalidRole {
                role: role.to_string(),
            });
        }
        Ok(())
    }

    fn pid_path(&self, role: &str) -> PathBuf {
        self.dir.join(format!("{}.pid", role))
    }

    /// Persist `pid` for `role`
    pub fn write(&self, role: &str, pid: u32) -> Result<(), RegistryError> {
        Self::validate_role(role)?;

        fs::create_dir_all(&self.dir).map_err(|source| RegistryError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.pid_path(role);
        fs::write(&path, format!("{}\n", pid)).map_err(|source| RegistryError::Io { path, source })
    }

    /// Persist `pid` for `role`; failures are only logged
    pub fn record(&self, role: &str, pid: u32) {
        match self.write(role, pid) {
            Ok(()) => debug!(role = %role, pid = pid, "recorded forwarder"),
            Err(e) => warn!(role = %role, pid = pid, error = %e, "failed to record forwarder PID"),
        }
    }

    /// PID recorded for `role`, if any
    pub fn read(&self, role: &str) -> Result<Option<u32>, RegistryError> {
        Self::validate_role(role)?;

        let path = self.pid_path(role);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        content
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RegistryError::Corrupt {
                path,
                content: content.trim().to_string(),
            })
    }

    /// Forget `role`. Returns true if a file was removed.
    pub fn remove(&self, role: &str) -> Result<bool, RegistryError> {
        Self::validate_role(role)?;

        let path = self.pid_path(role);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(RegistryError::Io { path, source }),
        }
    }

    /// All recorded roles with their PIDs, sorted by role
    pub fn list(&self) -> Result<Vec<(String, u32)>, RegistryError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut recorded = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| RegistryError::Io {
                    path: self.dir.clone(),
                    source,
                })?
                .path();

            if path.extension().and_then(|s| s.to_str()) != Some("pid") {
                continue;
            }
            let Some(role) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match self.read(role) {
                Ok(Some(pid)) => recorded.push((role.to_string(), pid)),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable PID file"),
            }
        }

        recorded.sort();
        Ok(recorded)
    }
}
