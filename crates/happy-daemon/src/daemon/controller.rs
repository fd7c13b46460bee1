//! Control operations shared by the HTTP surface and machine-scoped RPC.

use crate::daemon::session_registry::{SharedSessionRegistry, UpsertOutcome};
use crate::daemon::spawn::{DirectoryRefusal, SpawnConfig, prepare_directory, spawn_agent};
use happy_core::control::{
    HealthResponse, SessionStartedRequest, SessionStartedResponse, SpawnSessionRequest,
    SpawnSessionResponse, TrackedSession,
};
use happy_core::process::terminate_with_grace;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The daemon's control operations.
#[derive(Debug)]
pub struct DaemonController {
    registry: SharedSessionRegistry,
    spawn: SpawnConfig,
    stop_grace: Duration,
    shutdown: CancellationToken,
}

impl DaemonController {
    pub fn new(
        registry: SharedSessionRegistry,
        spawn: SpawnConfig,
        stop_grace: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            spawn,
            stop_grace,
            shutdown,
        })
    }

    pub fn registry(&self) -> &SharedSessionRegistry {
        &self.registry
    }

    /// Snapshot of all tracked sessions.
    pub fn list(&self) -> Vec<TrackedSession> {
        self.lock_registry().list()
    }

    /// Launch an agent. Never waits for the agent's session id.
    ///
    /// Failures are returned as `{success: false, error}`.
    pub fn spawn_session(&self, request: &SpawnSessionRequest) -> SpawnSessionResponse {
        let directory = PathBuf::from(&request.directory);

        if let Err(refusal) = prepare_directory(&directory, request.approved_new_directory_creation)
        {
            return match refusal {
                DirectoryRefusal::NeedsApproval(error) => {
                    info!(directory = %directory.display(), "spawn needs directory creation approval");
                    SpawnSessionResponse {
                        success: false,
                        error: Some(error),
                        request_to_approve_directory_creation: Some(true),
                        ..Default::default()
                    }
                }
                DirectoryRefusal::Invalid(error) => {
                    warn!(directory = %directory.display(), %error, "spawn refused");
                    SpawnSessionResponse::failed(error)
                }
            };
        }

        let (mut child, pid) =
            match spawn_agent(&self.spawn, &directory, request.session_id.as_deref()) {
                Ok(spawned) => spawned,
                Err(e) => {
                    warn!(error = %e, "failed to spawn agent");
                    return SpawnSessionResponse::failed(e.to_string());
                }
            };

        self.lock_registry().insert_spawned(pid, directory.clone());
        info!(pid, directory = %directory.display(), "spawned agent session");

        // Reap the child so its pid stops probing alive, then forget it.
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let status = child.wait().await;
            let removed = registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove_by_pid(pid)
                .is_some();
            match status {
                Ok(status) => info!(pid, %status, removed, "agent process exited"),
                Err(e) => warn!(pid, error = %e, "failed to wait for agent process"),
            }
        });

        SpawnSessionResponse::spawned(pid)
    }

    /// Terminate the session matching `session_id` (or `PID-<pid>`).
    ///
    /// Returns `false` only when nothing matches. A process that is already
    /// gone counts as stopped.
    pub async fn stop_session(&self, session_id: &str) -> bool {
        let pid = match self.lock_registry().find_by_session_id(session_id) {
            Some(session) => session.pid,
            None => {
                info!(session_id, "stop requested for unknown session");
                return false;
            }
        };

        let report = terminate_with_grace(&[pid], self.stop_grace).await;
        self.lock_registry().remove_by_pid(pid);
        info!(
            session_id,
            pid,
            killed = !report.killed.is_empty(),
            "stopped session"
        );
        true
    }

    /// Apply the `session-started` webhook.
    pub fn session_started(&self, request: &SessionStartedRequest) -> SessionStartedResponse {
        let Some(pid) = request.metadata.host_pid else {
            warn!(session_id = %request.session_id, "session-started without hostPid");
            return SessionStartedResponse {
                ok: false,
                error: Some("metadata.hostPid is required".to_string()),
            };
        };

        let outcome = self.lock_registry().on_session_started(
            pid,
            &request.session_id,
            request.metadata.clone(),
        );
        match outcome {
            UpsertOutcome::Updated => {
                info!(pid, session_id = %request.session_id, "session reported in")
            }
            UpsertOutcome::Inserted => {
                info!(pid, session_id = %request.session_id, "tracking terminal-started session")
            }
        }
        SessionStartedResponse {
            ok: true,
            error: None,
        }
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            pid: self.spawn.daemon_pid,
            version: env!("CARGO_PKG_VERSION").to_string(),
            sessions: self.lock_registry().len(),
        }
    }

    /// Begin graceful daemon shutdown. Returns immediately.
    pub fn request_stop(&self) {
        info!("daemon stop requested");
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn control_port(&self) -> u16 {
        self.spawn.control_port
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, crate::daemon::SessionRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::session_registry::new_session_registry;
    use happy_core::control::{SessionMetadata, StartedBy};
    use tempfile::TempDir;

    fn controller(agent_bin: &str, agent_args: &[&str]) -> Arc<DaemonController> {
        DaemonController::new(
            new_session_registry("machine-t"),
            SpawnConfig {
                agent_bin: agent_bin.to_string(),
                agent_args: agent_args.iter().map(|s| s.to_string()).collect(),
                daemon_pid: std::process::id(),
                control_port: 0,
                machine_id: "machine-t".to_string(),
            },
            Duration::from_secs(2),
            CancellationToken::new(),
        )
    }

    fn spawn_request(directory: &str) -> SpawnSessionRequest {
        SpawnSessionRequest {
            directory: directory.to_string(),
            session_id: None,
            approved_new_directory_creation: false,
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_structured_failure() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller("/nonexistent/agent", &[]);

        let resp = ctl.spawn_session(&spawn_request(tmp.path().to_str().unwrap()));
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("Failed to spawn"));
        assert!(ctl.list().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_missing_directory_asks_for_approval() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller("sleep", &["30"]);
        let missing = tmp.path().join("nope");

        let resp = ctl.spawn_session(&spawn_request(missing.to_str().unwrap()));
        assert!(!resp.success);
        assert_eq!(resp.request_to_approve_directory_creation, Some(true));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_webhook_stop_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller("sleep", &["30"]);

        let resp = ctl.spawn_session(&spawn_request(tmp.path().to_str().unwrap()));
        assert!(resp.success);
        let pid = resp.pid.unwrap();
        assert!(happy_core::process::is_pid_alive(pid));

        let ack = ctl.session_started(&SessionStartedRequest {
            session_id: "sess-1".to_string(),
            metadata: SessionMetadata {
                host_pid: Some(pid),
                ..Default::default()
            },
        });
        assert!(ack.ok);

        let sessions = ctl.list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].started_by, StartedBy::Daemon);
        assert_eq!(sessions[0].happy_session_id.as_deref(), Some("sess-1"));

        assert!(ctl.stop_session("sess-1").await);
        assert!(ctl.list().is_empty());
        assert!(!happy_core::process::is_pid_alive(pid));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_child_is_dropped_from_registry() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller("true", &[]);

        let resp = ctl.spawn_session(&spawn_request(tmp.path().to_str().unwrap()));
        assert!(resp.success);

        for _ in 0..100 {
            if ctl.list().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("exited child still tracked");
    }

    #[tokio::test]
    async fn test_stop_unknown_session_is_false() {
        let ctl = controller("sleep", &[]);
        assert!(!ctl.stop_session("ghost").await);
    }

    #[test]
    fn test_session_started_requires_host_pid() {
        let ctl = controller("sleep", &[]);
        let ack = ctl.session_started(&SessionStartedRequest {
            session_id: "s".to_string(),
            metadata: SessionMetadata::default(),
        });
        assert!(!ack.ok);
        assert!(ctl.list().is_empty());
    }

    #[test]
    fn test_request_stop_cancels_token() {
        let ctl = controller("sleep", &[]);
        ctl.request_stop();
        assert!(ctl.shutdown_token().is_cancelled());
    }
}
