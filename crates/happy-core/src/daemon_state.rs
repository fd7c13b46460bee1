//! Persisted daemon state: the single source of truth for "a daemon is running".
//!
//! The daemon writes `$HAPPY_HOME/daemon.state.json` once its control port is
//! bound:
//!
//! ```json
//! {"pid": 12345, "controlPort": 53011, "startedAt": "2026-10-19T08:00:00Z", "version": "0.3.0"}
//! ```
//!
//! Any process can find the daemon by reading this file and probing the
//! recorded pid with [`crate::process::is_pid_alive`]. A file whose pid is dead
//! (or whose contents cannot be parsed) is stale and is removed by the next
//! claimant.
//!
//! # Claim protocol
//!
//! 1. Create the file with `create_new(true)` (`O_EXCL`), so two concurrent
//!    starts cannot both succeed.
//! 2. If it already exists and the recorded pid is alive, refuse with
//!    [`DaemonError::AlreadyRunning`] and leave the file untouched.
//! 3. Otherwise remove the stale file and retry once.

use crate::error::DaemonError;
use crate::process::is_pid_alive;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Contents of the daemon state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    /// Process ID of the daemon
    pub pid: u32,
    /// Loopback TCP port of the control server
    pub control_port: u16,
    /// RFC 3339 timestamp of daemon start
    #[serde(default)]
    pub started_at: Option<String>,
    /// Crate version of the daemon that wrote the file
    #[serde(default)]
    pub version: Option<String>,
}

impl DaemonState {
    /// Build the state record for the current process.
    pub fn for_current_process(control_port: u16) -> Self {
        Self {
            pid: std::process::id(),
            control_port,
            started_at: Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }

    /// Returns `true` if the recorded pid is alive.
    pub fn is_alive(&self) -> bool {
        is_pid_alive(self.pid)
    }

    /// Base URL of the control server.
    pub fn control_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.control_port)
    }
}

/// Handle on the well-known state file path.
#[derive(Debug, Clone)]
pub struct DaemonStateFile {
    path: PathBuf,
}

impl DaemonStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State file under `home`.
    pub fn in_home(home: &Path) -> Self {
        Self::new(crate::home::daemon_state_path(home))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Json`] if the file is not valid state JSON, or
    /// [`DaemonError::Io`] for other read failures.
    pub fn read(&self) -> Result<Option<DaemonState>, DaemonError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(DaemonError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| DaemonError::Json {
                path: self.path.clone(),
                source,
            })
    }

    /// Return the recorded state only if its pid is alive.
    ///
    /// Never removes anything; unreadable files are reported as "not running".
    pub fn running(&self) -> Option<DaemonState> {
        match self.read() {
            Ok(Some(state)) if state.is_alive() => Some(state),
            _ => None,
        }
    }

    /// Refuse if a live daemon owns the file, otherwise discard stale state.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::AlreadyRunning`] when the recorded pid is alive.
    pub fn check_existing(&self) -> Result<(), DaemonError> {
        match self.read() {
            Ok(None) => Ok(()),
            Ok(Some(state)) if state.is_alive() => Err(DaemonError::AlreadyRunning {
                pid: state.pid,
                control_port: state.control_port,
            }),
            Ok(Some(state)) => {
                warn!(
                    pid = state.pid,
                    path = %self.path.display(),
                    "removing stale daemon state (process is gone)"
                );
                self.remove_unconditionally()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "removing unreadable daemon state");
                self.remove_unconditionally()
            }
        }
    }

    /// Atomically claim the state file for `state`.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::AlreadyRunning`] if a live daemon holds the file,
    /// or an I/O error if the file cannot be written.
    pub fn claim(&self, state: &DaemonState) -> Result<(), DaemonError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| DaemonError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let body = serde_json::to_string_pretty(state).map_err(|source| DaemonError::Json {
            path: self.path.clone(),
            source,
        })?;

        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let written = file
                        .write_all(body.as_bytes())
                        .and_then(|_| file.sync_all());
                    if let Err(source) = written {
                        let _ = std::fs::remove_file(&self.path);
                        return Err(DaemonError::Io {
                            path: self.path.clone(),
                            source,
                        });
                    }
                    info!(
                        pid = state.pid,
                        control_port = state.control_port,
                        path = %self.path.display(),
                        "daemon state written"
                    );
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Live owner → AlreadyRunning; stale → removed, retry once.
                    self.check_existing()?;
                }
                Err(source) => {
                    return Err(DaemonError::Io {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }

        // Lost a second race after discarding stale state.
        match self.read() {
            Ok(Some(existing)) => Err(DaemonError::AlreadyRunning {
                pid: existing.pid,
                control_port: existing.control_port,
            }),
            _ => Err(DaemonError::Io {
                path: self.path.clone(),
                source: std::io::Error::other("failed to claim daemon state file"),
            }),
        }
    }

    /// Remove the file only if it still names `pid`.
    ///
    /// A file rewritten by another daemon is left alone. Returns `true` if the
    /// file was removed.
    pub fn release(&self, pid: u32) -> bool {
        match self.read() {
            Ok(Some(state)) if state.pid == pid => self.remove_unconditionally().is_ok(),
            Ok(Some(state)) => {
                debug!(owner = state.pid, pid, "state file owned by another daemon; not removing");
                false
            }
            Ok(None) => false,
            Err(_) => self.remove_unconditionally().is_ok(),
        }
    }

    /// Remove the file regardless of its contents. Missing files are fine.
    pub fn remove_unconditionally(&self) -> Result<(), DaemonError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DaemonError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state_with_pid(pid: u32) -> DaemonState {
        DaemonState {
            pid,
            control_port: 4242,
            started_at: None,
            version: None,
        }
    }

    #[test]
    fn test_state_serializes_control_port_in_camel_case() {
        let json = serde_json::to_value(state_with_pid(7)).unwrap();
        assert_eq!(json["pid"], 7);
        assert_eq!(json["controlPort"], 4242);
    }

    #[test]
    fn test_read_missing_file_is_none() {
        let tmp = TempDir::new().unwrap();
        let file = DaemonStateFile::in_home(tmp.path());
        assert!(file.read().unwrap().is_none());
        assert!(file.running().is_none());
    }

    #[test]
    fn test_claim_writes_file() {
        let tmp = TempDir::new().unwrap();
        let file = DaemonStateFile::in_home(tmp.path());
        let state = DaemonState::for_current_process(5000);

        file.claim(&state).unwrap();

        let read = file.read().unwrap().unwrap();
        assert_eq!(read.pid, std::process::id());
        assert_eq!(read.control_port, 5000);
        assert!(read.version.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_claim_refuses_when_owner_alive_and_leaves_file() {
        let tmp = TempDir::new().unwrap();
        let file = DaemonStateFile::in_home(tmp.path());
        // The test process itself is a live owner.
        file.claim(&state_with_pid(std::process::id())).unwrap();

        let err = file.claim(&state_with_pid(1_999_999)).unwrap_err();
        assert!(err.to_string().contains("already running"));
        assert_eq!(file.read().unwrap().unwrap().pid, std::process::id());
    }

    #[cfg(unix)]
    #[test]
    fn test_claim_replaces_stale_state() {
        let tmp = TempDir::new().unwrap();
        let file = DaemonStateFile::in_home(tmp.path());
        std::fs::write(
            file.path(),
            serde_json::to_string(&state_with_pid(i32::MAX as u32)).unwrap(),
        )
        .unwrap();

        let ours = DaemonState::for_current_process(6000);
        file.claim(&ours).unwrap();
        assert_eq!(file.read().unwrap().unwrap().control_port, 6000);
    }

    #[test]
    fn test_check_existing_removes_garbage() {
        let tmp = TempDir::new().unwrap();
        let file = DaemonStateFile::in_home(tmp.path());
        std::fs::write(file.path(), "{not json").unwrap();

        file.check_existing().unwrap();
        assert!(!file.path().exists());
    }

    #[test]
    fn test_release_only_removes_own_state() {
        let tmp = TempDir::new().unwrap();
        let file = DaemonStateFile::in_home(tmp.path());
        file.claim(&state_with_pid(std::process::id())).unwrap();

        assert!(!file.release(1));
        assert!(file.path().exists());

        assert!(file.release(std::process::id()));
        assert!(!file.path().exists());
    }
}
