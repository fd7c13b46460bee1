//! Control surface message types shared by the daemon and its clients.
//!
//! The daemon serves these over loopback HTTP; every endpoint takes and
//! returns JSON:
//!
//! | Route              | Request                 | Response                 |
//! |--------------------|-------------------------|--------------------------|
//! | `POST /list`       | `{}`                    | [`ListResponse`]         |
//! | `POST /spawn-session` | [`SpawnSessionRequest`] | [`SpawnSessionResponse`] |
//! | `POST /stop-session`  | [`StopSessionRequest`]  | [`StopSessionResponse`]  |
//! | `POST /session-started` | [`SessionStartedRequest`] | [`SessionStartedResponse`] |
//! | `POST /stop`       | `{}`                    | [`StopDaemonResponse`]   |
//! | `GET /health`      | (none)                  | [`HealthResponse`]       |

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ROUTE_LIST: &str = "/list";
pub const ROUTE_SPAWN_SESSION: &str = "/spawn-session";
pub const ROUTE_STOP_SESSION: &str = "/stop-session";
pub const ROUTE_SESSION_STARTED: &str = "/session-started";
pub const ROUTE_STOP: &str = "/stop";
pub const ROUTE_HEALTH: &str = "/health";

/// Who launched a tracked agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartedBy {
    /// Launched by the user from a terminal; first seen via the webhook.
    Terminal,
    /// Launched by the daemon's `spawn-session`.
    Daemon,
}

impl std::fmt::Display for StartedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartedBy::Terminal => write!(f, "terminal"),
            StartedBy::Daemon => write!(f, "daemon"),
        }
    }
}

/// The daemon's record of one agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedSession {
    /// OS process ID; known at spawn time and the join key for the webhook
    pub pid: u32,
    /// Working directory of the agent
    pub directory: PathBuf,
    pub started_by: StartedBy,
    /// Session id reported by the agent's webhook; `None` until it arrives
    pub happy_session_id: Option<String>,
    pub machine_id: String,
    /// RFC 3339 timestamp
    pub started_at: String,
    /// Metadata from the most recent webhook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
}

/// Metadata a session reports about itself in `session-started`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// PID of the agent process reporting in
    pub host_pid: Option<u32>,
    /// Working directory of the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_by: Option<StartedBy>,
    /// Any additional fields are preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Response of `list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub children: Vec<TrackedSession>,
}

/// Request of `spawn-session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSessionRequest {
    pub directory: String,
    /// Session to resume, passed to the agent as `HAPPY_RESUME_SESSION_ID`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Create `directory` if it does not exist
    #[serde(default)]
    pub approved_new_directory_creation: bool,
}

/// Response of `spawn-session`. Failures are structured, never HTTP faults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSessionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when `directory` is missing and creation was not approved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_to_approve_directory_creation: Option<bool>,
}

impl SpawnSessionResponse {
    pub fn spawned(pid: u32) -> Self {
        Self {
            success: true,
            pid: Some(pid),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Request of `stop-session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionRequest {
    /// Reported session id, or `PID-<pid>` for sessions not yet reported
    pub session_id: String,
}

/// Response of `stop-session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSessionResponse {
    pub success: bool,
}

/// Request of the `session-started` webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartedRequest {
    pub session_id: String,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

/// Response of the `session-started` webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartedResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopDaemonResponse {
    /// Always `"stopping"`
    pub status: String,
}

/// Response of `health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub pid: u32,
    pub version: String,
    pub sessions: usize,
}

/// Parse the `PID-<pid>` alias accepted by `stop-session`.
pub fn parse_pid_alias(session_id: &str) -> Option<u32> {
    session_id.strip_prefix("PID-")?.parse().ok()
}
