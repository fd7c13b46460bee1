//! Turn-affecting session mode.
//!
//! Two messages may be merged into one agent turn only when they were sent
//! under the same [`EnhancedMode`]. The queue compares modes through
//! [`mode_hash`], never by inspecting fields itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tool-approval policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Every tool call is negotiated with the remote approver.
    #[default]
    Default,
    /// Only read-capable tools run; nothing is asked.
    ReadOnly,
    /// Approve everything for the session without asking.
    SafeYolo,
    /// Approve everything for the session without asking.
    Yolo,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::ReadOnly => "read-only",
            PermissionMode::SafeYolo => "safe-yolo",
            PermissionMode::Yolo => "yolo",
        }
    }

    /// `true` for modes that approve without a round trip.
    pub fn auto_approves(self) -> bool {
        matches!(self, PermissionMode::Yolo | PermissionMode::SafeYolo)
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "read-only" => Ok(PermissionMode::ReadOnly),
            "safe-yolo" => Ok(PermissionMode::SafeYolo),
            "yolo" => Ok(PermissionMode::Yolo),
            other => Err(format!("unknown permission mode: {other}")),
        }
    }
}

/// Mode tuple carried by each queued message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedMode {
    pub permission_mode: PermissionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl EnhancedMode {
    pub fn new(permission_mode: PermissionMode, model: Option<String>) -> Self {
        Self {
            permission_mode,
            model,
        }
    }
}

/// Stable comparison key for a mode: its canonical JSON encoding.
pub fn mode_hash(mode: &EnhancedMode) -> String {
    serde_json::to_string(mode).unwrap_or_else(|_| format!("{mode:?}"))
}
