//! Launching agent processes.
//!
//! Every daemon-spawned agent carries marker environment variables so it can
//! find its daemon and so an orphan scan can recognise it after the daemon
//! dies:
//!
//! | Variable                  | Value                                 |
//! |---------------------------|---------------------------------------|
//! | `HAPPY_DAEMON_PID`        | pid of the spawning daemon            |
//! | `HAPPY_DAEMON_PORT`       | control port of the spawning daemon   |
//! | `HAPPY_MACHINE_ID`        | machine id                            |
//! | `HAPPY_RESUME_SESSION_ID` | session to resume, when requested     |

use happy_core::error::DaemonError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

pub const ENV_DAEMON_PID: &str = "HAPPY_DAEMON_PID";
pub const ENV_DAEMON_PORT: &str = "HAPPY_DAEMON_PORT";
pub const ENV_MACHINE_ID: &str = "HAPPY_MACHINE_ID";
pub const ENV_RESUME_SESSION_ID: &str = "HAPPY_RESUME_SESSION_ID";

/// How agents are launched by this daemon.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub agent_bin: String,
    pub agent_args: Vec<String>,
    pub daemon_pid: u32,
    pub control_port: u16,
    pub machine_id: String,
}

/// Why a working directory cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryRefusal {
    /// Missing and creation was not approved; the caller may ask the user.
    NeedsApproval(String),
    /// Unusable for another reason.
    Invalid(String),
}

/// Make sure `directory` exists and is a directory, creating it when
/// `approved_creation` is set.
pub fn prepare_directory(directory: &Path, approved_creation: bool) -> Result<(), DirectoryRefusal> {
    match std::fs::metadata(directory) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(DirectoryRefusal::Invalid(format!(
            "Path is not a directory: {}",
            directory.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if !approved_creation {
                return Err(DirectoryRefusal::NeedsApproval(format!(
                    "Directory does not exist: {}",
                    directory.display()
                )));
            }
            std::fs::create_dir_all(directory).map_err(|e| {
                DirectoryRefusal::Invalid(format!(
                    "Failed to create directory {}: {e}",
                    directory.display()
                ))
            })?;
            info!(directory = %directory.display(), "created session directory");
            Ok(())
        }
        Err(e) => Err(DirectoryRefusal::Invalid(format!(
            "Cannot access {}: {e}",
            directory.display()
        ))),
    }
}

/// Launch one agent process in `directory`.
///
/// Stdio is detached. The returned [`Child`] must be awaited by the caller so
/// the process is reaped when it exits.
///
/// # Errors
///
/// Returns [`DaemonError::ProcessSpawn`] if the executable cannot be started.
pub fn spawn_agent(
    config: &SpawnConfig,
    directory: &Path,
    resume_session_id: Option<&str>,
) -> Result<(Child, u32), DaemonError> {
    let mut cmd = Command::new(&config.agent_bin);
    cmd.args(&config.agent_args)
        .current_dir(directory)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .env(ENV_DAEMON_PID, config.daemon_pid.to_string())
        .env(ENV_DAEMON_PORT, config.control_port.to_string())
        .env(ENV_MACHINE_ID, &config.machine_id);
    if let Some(session_id) = resume_session_id {
        cmd.env(ENV_RESUME_SESSION_ID, session_id);
    }

    debug!(
        bin = %config.agent_bin,
        args = ?config.agent_args,
        directory = %directory.display(),
        "spawning agent"
    );

    let child = cmd.spawn().map_err(|e| spawn_error(directory, e.to_string()))?;
    let pid = child
        .id()
        .ok_or_else(|| spawn_error(directory, "process exited before its pid was read".into()))?;
    Ok((child, pid))
}

fn spawn_error(directory: &Path, message: String) -> DaemonError {
    DaemonError::ProcessSpawn {
        directory: PathBuf::from(directory),
        message,
    }
}
