//! Session registry for tracking agent processes.
//!
//! The registry maps OS process IDs to [`TrackedSession`] records. The pid is
//! the join key: `spawn-session` knows it immediately, and the agent reports
//! it back as `metadata.hostPid` in its `session-started` webhook together
//! with its real session id.
//!
//! Either order is tolerated:
//! - spawn first, webhook later: the entry is updated in place
//! - webhook for a pid the daemon never spawned: a `terminal` entry is inserted
//! - webhook never arrives: the entry keeps `happySessionId = None` until
//!   [`SessionRegistry::reap_dead`] drops the dead pid
//!
//! ## Thread safety
//!
//! The registry itself is not `Sync`. Callers are expected to wrap it in
//! `Arc<Mutex<SessionRegistry>>` before sharing between tasks.

use happy_core::control::{SessionMetadata, StartedBy, TrackedSession, parse_pid_alias};
use happy_core::process::is_pid_alive;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

/// Result of [`SessionRegistry::on_session_started`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// An existing entry with the reported pid was updated in place.
    Updated,
    /// No entry had the pid; a new `terminal` entry was inserted.
    Inserted,
}

/// Registry of tracked agent sessions keyed by pid.
#[derive(Debug)]
pub struct SessionRegistry {
    machine_id: String,
    sessions: BTreeMap<u32, TrackedSession>,
}

impl SessionRegistry {
    /// Create a new, empty registry for `machine_id`.
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            sessions: BTreeMap::new(),
        }
    }

    /// Record a process the daemon just spawned. Its session id is unknown
    /// until the webhook arrives.
    pub fn insert_spawned(&mut self, pid: u32, directory: PathBuf) -> &TrackedSession {
        let session = TrackedSession {
            pid,
            directory,
            started_by: StartedBy::Daemon,
            happy_session_id: None,
            machine_id: self.machine_id.clone(),
            started_at: now_rfc3339(),
            metadata: None,
        };
        self.sessions.entry(pid).or_insert(session)
    }

    /// Apply a `session-started` webhook.
    ///
    /// Matches by pid only. A session id that is already attached to a
    /// different pid is logged and left on both entries.
    pub fn on_session_started(
        &mut self,
        pid: u32,
        session_id: &str,
        metadata: SessionMetadata,
    ) -> UpsertOutcome {
        if let Some(other) = self
            .sessions
            .values()
            .find(|s| s.pid != pid && s.happy_session_id.as_deref() == Some(session_id))
        {
            warn!(
                session_id,
                pid,
                existing_pid = other.pid,
                "session id already tracked under another pid"
            );
        }

        if let Some(existing) = self.sessions.get_mut(&pid) {
            existing.happy_session_id = Some(session_id.to_string());
            existing.metadata = Some(metadata);
            return UpsertOutcome::Updated;
        }

        let directory = metadata
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_default();
        let machine_id = metadata
            .machine_id
            .clone()
            .unwrap_or_else(|| self.machine_id.clone());
        self.sessions.insert(
            pid,
            TrackedSession {
                pid,
                directory,
                started_by: StartedBy::Terminal,
                happy_session_id: Some(session_id.to_string()),
                machine_id,
                started_at: now_rfc3339(),
                metadata: Some(metadata),
            },
        );
        UpsertOutcome::Inserted
    }

    /// Find the entry for a reported session id, or a `PID-<pid>` alias.
    pub fn find_by_session_id(&self, session_id: &str) -> Option<&TrackedSession> {
        if let Some(found) = self
            .sessions
            .values()
            .find(|s| s.happy_session_id.as_deref() == Some(session_id))
        {
            return Some(found);
        }
        parse_pid_alias(session_id).and_then(|pid| self.sessions.get(&pid))
    }

    pub fn get(&self, pid: u32) -> Option<&TrackedSession> {
        self.sessions.get(&pid)
    }

    pub fn remove_by_pid(&mut self, pid: u32) -> Option<TrackedSession> {
        self.sessions.remove(&pid)
    }

    /// Snapshot of every tracked session, ordered by pid.
    pub fn list(&self) -> Vec<TrackedSession> {
        self.sessions.values().cloned().collect()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    /// Drop entries whose process no longer exists. Returns the reaped pids.
    pub fn reap_dead(&mut self) -> Vec<u32> {
        self.reap_where(|pid| !is_pid_alive(pid))
    }

    fn reap_where(&mut self, is_dead: impl Fn(u32) -> bool) -> Vec<u32> {
        let dead: Vec<u32> = self.sessions.keys().copied().filter(|&p| is_dead(p)).collect();
        for pid in &dead {
            self.sessions.remove(pid);
        }
        dead
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Shared, thread-safe session registry handle.
pub type SharedSessionRegistry = std::sync::Arc<std::sync::Mutex<SessionRegistry>>;

/// Create a new empty [`SharedSessionRegistry`].
pub fn new_session_registry(machine_id: impl Into<String>) -> SharedSessionRegistry {
    std::sync::Arc::new(std::sync::Mutex::new(SessionRegistry::new(machine_id)))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
