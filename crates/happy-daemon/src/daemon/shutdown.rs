//! Graceful shutdown of the daemon.
//!
//! Order is fixed: signal every tracked child, wait the grace period,
//! SIGKILL the stragglers, and only then remove the state file. Nothing can
//! observe a "running" marker for a daemon that is already dead.

use crate::daemon::session_registry::SharedSessionRegistry;
use happy_core::daemon_state::DaemonStateFile;
use happy_core::process::{TerminationReport, terminate_with_grace};
use std::time::Duration;
use tracing::{info, warn};

/// Stop every tracked session and release the state file.
pub async fn graceful_shutdown(
    registry: &SharedSessionRegistry,
    state_file: &DaemonStateFile,
    own_pid: u32,
    grace: Duration,
) -> TerminationReport {
    let pids = registry.lock().unwrap_or_else(|e| e.into_inner()).pids();
    info!(sessions = pids.len(), ?grace, "beginning graceful shutdown");

    let report = terminate_with_grace(&pids, grace).await;
    if !report.killed.is_empty() {
        warn!(pids = ?report.killed, "force-killed sessions after grace period");
    }

    {
        let mut reg = registry.lock().unwrap_or_else(|e| e.into_inner());
        for pid in &pids {
            reg.remove_by_pid(*pid);
        }
    }

    if state_file.release(own_pid) {
        info!(path = %state_file.path().display(), "daemon state removed");
    } else {
        warn!(path = %state_file.path().display(), "daemon state not removed (not ours or already gone)");
    }

    info!(
        exited = report.exited.len(),
        killed = report.killed.len(),
        "graceful shutdown complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::session_registry::new_session_registry;
    use happy_core::daemon_state::DaemonState;
    use happy_core::process::is_pid_alive;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_children_stopped_before_state_removed() {
        let tmp = TempDir::new().unwrap();
        let file = DaemonStateFile::in_home(tmp.path());
        file.claim(&DaemonState::for_current_process(1)).unwrap();

        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        let registry = new_session_registry("m");
        registry.lock().unwrap().insert_spawned(pid, PathBuf::from("/"));

        let report =
            graceful_shutdown(&registry, &file, std::process::id(), Duration::from_secs(5)).await;
        reaper.await.unwrap().unwrap();

        assert_eq!(report.exited, vec![pid]);
        assert!(!is_pid_alive(pid));
        assert!(registry.lock().unwrap().is_empty());
        assert!(!file.path().exists());
    }

    #[tokio::test]
    async fn test_foreign_state_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let file = DaemonStateFile::in_home(tmp.path());
        file.claim(&DaemonState::for_current_process(1)).unwrap();

        graceful_shutdown(
            &new_session_registry("m"),
            &file,
            std::process::id() + 1,
            Duration::from_millis(10),
        )
        .await;
        assert!(file.path().exists());
    }
}
