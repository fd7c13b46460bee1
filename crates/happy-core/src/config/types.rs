//! Settings types for happy-control.
//!
//! [`Settings`] is deserialized from `$HAPPY_HOME/settings.toml`. Every field
//! has a default so a missing or partial file still yields a usable
//! configuration.
//!
//! # Example `settings.toml`
//!
//! ```toml
//! machine_id = "6f1c3a0e-9d2b-4f7e-8a51-0c7d3e2b9f10"
//!
//! [daemon]
//! agent_bin = "/usr/local/bin/happy"
//! agent_args = ["--started-by", "daemon"]
//! shutdown_grace_ms = 3000
//!
//! [session]
//! permission_timeout_secs = 300
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_agent_bin() -> String {
    "happy".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["--started-by".to_string(), "daemon".to_string()]
}

fn default_shutdown_grace_ms() -> u64 {
    3000
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_orphan_grace_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_permission_timeout_secs() -> u64 {
    300
}

/// Daemon-side settings (`[daemon]` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Agent executable launched by `spawn-session` (default: `"happy"` from `PATH`)
    #[serde(default = "default_agent_bin")]
    pub agent_bin: String,

    /// Arguments passed to every daemon-spawned agent
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,

    /// Grace period between SIGTERM and SIGKILL during shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Interval of the liveness heartbeat (default: `60`)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Grace period used when reaping orphaned agents
    #[serde(default = "default_orphan_grace_ms")]
    pub orphan_grace_ms: u64,

    /// Timeout for control requests issued by [`crate::daemon_client`]
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            agent_bin: default_agent_bin(),
            agent_args: default_agent_args(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            orphan_grace_ms: default_orphan_grace_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl DaemonSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_millis(self.orphan_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Session-side settings (`[session]` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSettings {
    /// How long a `default`-mode permission request waits before resolving `denied`
    #[serde(default = "default_permission_timeout_secs")]
    pub permission_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            permission_timeout_secs: default_permission_timeout_secs(),
        }
    }
}

impl SessionSettings {
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_secs)
    }
}

/// Resolved settings file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Stable identifier of this machine; generated on first use
    #[serde(default)]
    pub machine_id: Option<String>,

    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub session: SessionSettings,
}
