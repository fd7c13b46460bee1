//! Periodic liveness maintenance.
//!
//! Each tick:
//! 1. drops registry entries whose pid is gone (sessions that died before or
//!    after reporting in)
//! 2. re-reads the state file; if it no longer names this daemon, another
//!    daemon has taken over and this one shuts itself down

use crate::daemon::session_registry::SharedSessionRegistry;
use happy_core::daemon_state::DaemonStateFile;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one heartbeat tick decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Healthy { reaped: Vec<u32> },
    /// The state file is missing or names another pid.
    Superseded { owner: Option<u32> },
}

/// Run a single heartbeat tick.
pub fn heartbeat_tick(
    registry: &SharedSessionRegistry,
    state_file: &DaemonStateFile,
    own_pid: u32,
) -> HeartbeatOutcome {
    let reaped = registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .reap_dead();
    if !reaped.is_empty() {
        info!(pids = ?reaped, "reaped dead sessions");
    }

    match state_file.read() {
        Ok(Some(state)) if state.pid == own_pid => HeartbeatOutcome::Healthy { reaped },
        Ok(Some(state)) => HeartbeatOutcome::Superseded {
            owner: Some(state.pid),
        },
        Ok(None) => HeartbeatOutcome::Superseded { owner: None },
        Err(e) => {
            // A torn read is not proof of takeover; check again next tick.
            debug!(error = %e, "unreadable daemon state during heartbeat");
            HeartbeatOutcome::Healthy { reaped }
        }
    }
}

/// Tick every `interval` until `cancel` fires. Cancels `cancel` itself when
/// the daemon has been superseded.
pub async fn heartbeat_loop(
    registry: SharedSessionRegistry,
    state_file: DaemonStateFile,
    own_pid: u32,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let HeartbeatOutcome::Superseded { owner } =
                    heartbeat_tick(&registry, &state_file, own_pid)
                {
                    warn!(?owner, "daemon state no longer names this process; shutting down");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    debug!("heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::session_registry::new_session_registry;
    use happy_core::daemon_state::DaemonState;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn claimed(tmp: &TempDir) -> DaemonStateFile {
        let file = DaemonStateFile::in_home(tmp.path());
        file.claim(&DaemonState::for_current_process(1234)).unwrap();
        file
    }

    #[test]
    fn test_tick_reaps_dead_pid() {
        let tmp = TempDir::new().unwrap();
        let file = claimed(&tmp);
        let registry = new_session_registry("m");
        registry
            .lock()
            .unwrap()
            .insert_spawned(i32::MAX as u32, PathBuf::from("/"));

        let outcome = heartbeat_tick(&registry, &file, std::process::id());
        assert_eq!(
            outcome,
            HeartbeatOutcome::Healthy {
                reaped: vec![i32::MAX as u32]
            }
        );
        assert!(registry.lock().unwrap().is_empty());
    }

    #[test]
    fn test_tick_detects_takeover() {
        let tmp = TempDir::new().unwrap();
        let file = claimed(&tmp);
        let registry = new_session_registry("m");

        let outcome = heartbeat_tick(&registry, &file, std::process::id() + 1);
        assert_eq!(
            outcome,
            HeartbeatOutcome::Superseded {
                owner: Some(std::process::id())
            }
        );
    }

    #[test]
    fn test_tick_detects_removed_state() {
        let tmp = TempDir::new().unwrap();
        let file = DaemonStateFile::in_home(tmp.path());
        let registry = new_session_registry("m");

        let outcome = heartbeat_tick(&registry, &file, std::process::id());
        assert_eq!(outcome, HeartbeatOutcome::Superseded { owner: None });
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_cancels_when_superseded() {
        let tmp = TempDir::new().unwrap();
        let file = DaemonStateFile::in_home(tmp.path());
        let cancel = CancellationToken::new();

        heartbeat_loop(
            new_session_registry("m"),
            file,
            std::process::id(),
            Duration::from_secs(60),
            cancel.clone(),
        )
        .await;

        assert!(cancel.is_cancelled());
    }
}
