//! Client for the daemon's loopback control server.
//!
//! The daemon publishes its control port in `$HAPPY_HOME/daemon.state.json`
//! (see [`crate::daemon_state`]). Clients read that file, probe the recorded
//! pid and then talk JSON over HTTP to `http://127.0.0.1:<controlPort>`:
//!
//! ```json
//! // POST /spawn-session
//! {"directory":"/work/repo","approvedNewDirectoryCreation":false}
//! // Response
//! {"success":true,"pid":48213}
//! ```
//!
//! # Graceful fallback
//!
//! [`DaemonClient::connect`] returns `Ok(None)` when no live daemon is recorded.
//! Once connected, transport failures surface as [`DaemonError::Http`].

use crate::control::{
    HealthResponse, ListResponse, ROUTE_HEALTH, ROUTE_LIST, ROUTE_SESSION_STARTED,
    ROUTE_SPAWN_SESSION, ROUTE_STOP, ROUTE_STOP_SESSION, SessionMetadata, SessionStartedRequest,
    SessionStartedResponse, SpawnSessionRequest, SpawnSessionResponse, StopDaemonResponse,
    StopSessionRequest, StopSessionResponse, TrackedSession,
};
use crate::daemon_state::{DaemonState, DaemonStateFile};
use crate::error::DaemonError;
use crate::process::{TerminationReport, terminate_with_grace};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client bound to one running daemon.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    base_url: String,
    state: DaemonState,
    http: reqwest::Client,
}

impl DaemonClient {
    /// Build a client for the daemon described by `state`.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Http`] if the HTTP client cannot be constructed.
    pub fn from_state(state: DaemonState, timeout: Duration) -> Result<Self, DaemonError> {
        let base_url = state.control_url();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DaemonError::Http {
                endpoint: base_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            base_url,
            state,
            http,
        })
    }

    /// Connect to the daemon recorded under `home`, if it is alive.
    pub fn connect(home: &Path, timeout: Duration) -> Result<Option<Self>, DaemonError> {
        match DaemonStateFile::in_home(home).running() {
            Some(state) => Self::from_state(state, timeout).map(Some),
            None => Ok(None),
        }
    }

    /// State record this client was built from.
    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List tracked sessions.
    pub async fn list(&self) -> Result<Vec<TrackedSession>, DaemonError> {
        let resp: ListResponse = self.post(ROUTE_LIST, &serde_json::json!({})).await?;
        Ok(resp.children)
    }

    /// Ask the daemon to launch an agent in `directory`.
    pub async fn spawn_session(
        &self,
        request: &SpawnSessionRequest,
    ) -> Result<SpawnSessionResponse, DaemonError> {
        self.post(ROUTE_SPAWN_SESSION, request).await
    }

    /// Stop a session by reported id or `PID-<pid>` alias.
    ///
    /// Returns `false` when the daemon tracks no such session.
    pub async fn stop_session(&self, session_id: &str) -> Result<bool, DaemonError> {
        let resp: StopSessionResponse = self
            .post(
                ROUTE_STOP_SESSION,
                &StopSessionRequest {
                    session_id: session_id.to_string(),
                },
            )
            .await?;
        Ok(resp.success)
    }

    /// Report a freshly started session to the daemon.
    pub async fn notify_session_started(
        &self,
        session_id: &str,
        metadata: SessionMetadata,
    ) -> Result<SessionStartedResponse, DaemonError> {
        self.post(
            ROUTE_SESSION_STARTED,
            &SessionStartedRequest {
                session_id: session_id.to_string(),
                metadata,
            },
        )
        .await
    }

    /// Request a graceful daemon shutdown. Returns once the daemon acknowledges.
    pub async fn stop(&self) -> Result<StopDaemonResponse, DaemonError> {
        self.post(ROUTE_STOP, &serde_json::json!({})).await
    }

    pub async fn health(&self) -> Result<HealthResponse, DaemonError> {
        let url = format!("{}{}", self.base_url, ROUTE_HEALTH);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.http_error(ROUTE_HEALTH, e))?;
        Self::decode(ROUTE_HEALTH, resp).await
    }

    async fn post<B, R>(&self, route: &str, body: &B) -> Result<R, DaemonError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, route);
        debug!(%url, "daemon control request");
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.http_error(route, e))?;
        Self::decode(route, resp).await
    }

    async fn decode<R: DeserializeOwned>(
        route: &str,
        resp: reqwest::Response,
    ) -> Result<R, DaemonError> {
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(DaemonError::Http {
                endpoint: route.to_string(),
                message: format!("HTTP {status}: {text}"),
            });
        }
        resp.json::<R>().await.map_err(|e| DaemonError::Http {
            endpoint: route.to_string(),
            message: format!("invalid response body: {e}"),
        })
    }

    fn http_error(&self, route: &str, err: reqwest::Error) -> DaemonError {
        DaemonError::Http {
            endpoint: format!("{}{}", self.base_url, route),
            message: err.to_string(),
        }
    }
}

/// Return the running daemon's state, or `None` if no live daemon is recorded.
///
/// Never modifies the state file.
pub fn check_if_daemon_running(home: &Path) -> Option<DaemonState> {
    DaemonStateFile::in_home(home).running()
}

/// How [`stop_daemon`] brought the daemon down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// No live daemon was recorded; any stale state file was removed.
    NotRunning,
    /// The daemon acknowledged `/stop` and exited within the grace period.
    Graceful { pid: u32 },
    /// The control request failed or timed out and the pid was signalled.
    Forced { pid: u32, report: TerminationReport },
}

/// Stop the daemon recorded under `home`.
///
/// Sends `POST /stop` and waits up to `grace` for the process to exit. If the
/// request fails or the daemon lingers, falls back to SIGTERM/SIGKILL on the
/// recorded pid. A stale state file left behind by a forced stop is removed.
pub async fn stop_daemon(home: &Path, grace: Duration) -> Result<StopOutcome, DaemonError> {
    let file = DaemonStateFile::in_home(home);
    let state = match file.read() {
        Ok(Some(state)) if state.is_alive() => state,
        Ok(Some(state)) => {
            info!(pid = state.pid, "daemon not running; removing stale state");
            file.remove_unconditionally()?;
            return Ok(StopOutcome::NotRunning);
        }
        Ok(None) => return Ok(StopOutcome::NotRunning),
        Err(e) => {
            warn!(error = %e, "unreadable daemon state; removing");
            file.remove_unconditionally()?;
            return Ok(StopOutcome::NotRunning);
        }
    };
    let pid = state.pid;

    let client = DaemonClient::from_state(state, grace.max(Duration::from_secs(1)))?;
    match client.stop().await {
        Ok(_) => {
            if wait_for_exit(pid, grace).await {
                info!(pid, "daemon stopped");
                return Ok(StopOutcome::Graceful { pid });
            }
            warn!(pid, "daemon acknowledged stop but did not exit; escalating");
        }
        Err(e) => warn!(pid, error = %e, "stop request failed; signalling daemon"),
    }

    let report = terminate_with_grace(&[pid], grace).await;
    // The daemon removes its own state on a clean exit; a killed one cannot.
    file.release(pid);
    Ok(StopOutcome::Forced { pid, report })
}

async fn wait_for_exit(pid: u32, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if !crate::process::is_pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
