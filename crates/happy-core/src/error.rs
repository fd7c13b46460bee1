//! Error types shared by the daemon and its clients

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by daemon lifecycle and control operations
#[derive(Error, Debug)]
pub enum DaemonError {
    /// A live daemon already owns the state file
    #[error("Daemon already running (pid {pid}, control port {control_port})")]
    AlreadyRunning { pid: u32, control_port: u16 },

    /// Launching an agent process failed
    #[error("Failed to spawn agent process in {directory}: {message}")]
    ProcessSpawn { directory: PathBuf, message: String },

    /// The loopback control port could not be bound
    #[error("Failed to bind daemon control server: {source}")]
    Bind { source: std::io::Error },

    /// File I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse or serialize JSON
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Control request to a running daemon failed
    #[error("Daemon control request to {endpoint} failed: {message}")]
    Http { endpoint: String, message: String },
}

impl DaemonError {
    /// Returns `true` for the clean "already running" refusal.
    pub fn is_already_running(&self) -> bool {
        matches!(self, DaemonError::AlreadyRunning { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_message() {
        let err = DaemonError::AlreadyRunning {
            pid: 42,
            control_port: 5555,
        };
        assert!(err.to_string().contains("already running"));
        assert!(err.is_already_running());
    }

    #[test]
    fn test_spawn_error_message_names_directory() {
        let err = DaemonError::ProcessSpawn {
            directory: PathBuf::from("/tmp/work"),
            message: "No such file or directory".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("/tmp/work"));
        assert!(!err.is_already_running());
    }
}
