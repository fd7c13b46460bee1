//! Tool-call permission negotiation.
//!
//! Every tool call the agent backend wants to run goes through
//! [`PermissionNegotiator::handle_tool_call`], which resolves it exactly once
//! to a [`PermissionDecision`]:
//!
//! | Mode        | Behaviour                                                   |
//! |-------------|-------------------------------------------------------------|
//! | `yolo`      | `approved_for_session`, nothing pending                     |
//! | `safe-yolo` | `approved_for_session`, nothing pending                     |
//! | `read-only` | read-capable tools approved, everything else denied         |
//! | `default`   | pending entry + `Requested` event; waits for the remote side |
//!
//! A pending request ends through [`PermissionNegotiator::handle_permission_response`],
//! [`PermissionNegotiator::reset`] (forces `abort`), or the configured timeout
//! (forces `denied`). Whichever happens first wins; the others find no entry
//! and do nothing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use happy_core::config::SessionSettings;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::mode::PermissionMode;

/// Completed requests kept for inspection.
const COMPLETED_HISTORY: usize = 100;

/// Tool names approved in `read-only` mode only on exact match.
const READ_ONLY_EXACT: &[&str] = &["ls", "find", "cat", "head", "tail"];

/// Tool-name fragments approved in `read-only` mode on substring match.
const READ_ONLY_FRAGMENTS: &[&str] = &["read", "glob", "grep", "search", "fetch", "view", "list"];

/// Terminal outcome of one permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Approved,
    ApprovedForSession,
    Denied,
    Abort,
}

impl PermissionDecision {
    pub fn is_allowed(self) -> bool {
        matches!(
            self,
            PermissionDecision::Approved | PermissionDecision::ApprovedForSession
        )
    }
}

/// A tool call awaiting approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Events sent toward the remote approver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PermissionEvent {
    /// A `default`-mode request is waiting for a decision.
    Requested(PermissionRequest),
    /// A previously requested id reached its terminal decision.
    Resolved {
        id: String,
        decision: PermissionDecision,
    },
}

/// Outbound channel for [`PermissionEvent`]s.
pub trait PermissionEventSink: Send + Sync {
    fn emit(&self, event: PermissionEvent);
}

impl PermissionEventSink for mpsc::UnboundedSender<PermissionEvent> {
    fn emit(&self, event: PermissionEvent) {
        if self.send(event).is_err() {
            debug!("permission event receiver dropped");
        }
    }
}

/// Record of a request that reached its decision.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPermission {
    pub request: PermissionRequest,
    pub decision: PermissionDecision,
    pub resolved_at: DateTime<Utc>,
}

struct PendingPermission {
    request: PermissionRequest,
    /// Distinguishes a re-used id from the request it displaced.
    seq: u64,
    respond: oneshot::Sender<PermissionDecision>,
}

struct NegotiatorState {
    mode: PermissionMode,
    pending: HashMap<String, PendingPermission>,
    session_allowed: HashSet<String>,
    completed: VecDeque<CompletedPermission>,
    next_seq: u64,
}

impl NegotiatorState {
    fn record(&mut self, request: PermissionRequest, decision: PermissionDecision) {
        if decision == PermissionDecision::ApprovedForSession {
            self.session_allowed.insert(request.tool_name.clone());
        }
        if self.completed.len() == COMPLETED_HISTORY {
            self.completed.pop_front();
        }
        self.completed.push_back(CompletedPermission {
            request,
            decision,
            resolved_at: Utc::now(),
        });
    }
}

/// Resolves tool calls to decisions according to the current mode.
pub struct PermissionNegotiator {
    state: Mutex<NegotiatorState>,
    sink: Arc<dyn PermissionEventSink>,
    timeout: Duration,
}

impl std::fmt::Debug for PermissionNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PermissionNegotiator")
            .field("mode", &state.mode)
            .field("pending", &state.pending.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PermissionNegotiator {
    pub fn new(sink: Arc<dyn PermissionEventSink>, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(NegotiatorState {
                mode: PermissionMode::Default,
                pending: HashMap::new(),
                session_allowed: HashSet::new(),
                completed: VecDeque::new(),
                next_seq: 0,
            }),
            sink,
            timeout,
        }
    }

    pub fn from_settings(sink: Arc<dyn PermissionEventSink>, settings: &SessionSettings) -> Self {
        Self::new(sink, settings.permission_timeout())
    }

    pub fn mode(&self) -> PermissionMode {
        self.lock().mode
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        let mut state = self.lock();
        if state.mode != mode {
            info!(from = %state.mode, to = %mode, "permission mode changed");
            state.mode = mode;
        }
    }

    /// Resolve one tool call.
    ///
    /// In `default` mode this waits until a response, a reset or the timeout
    /// arrives. Dropping the returned future resolves the request to `abort`.
    pub async fn handle_tool_call(
        &self,
        id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
    ) -> PermissionDecision {
        let id = id.into();
        let tool_name = tool_name.into();

        let (request, seq, displaced, mut decided) = {
            let mut state = self.lock();
            match state.mode {
                PermissionMode::Yolo | PermissionMode::SafeYolo => {
                    return PermissionDecision::ApprovedForSession;
                }
                PermissionMode::ReadOnly => {
                    return if is_read_only_tool(&tool_name) {
                        PermissionDecision::Approved
                    } else {
                        debug!(tool = %tool_name, "denied in read-only mode");
                        PermissionDecision::Denied
                    };
                }
                PermissionMode::Default => {}
            }

            if state.session_allowed.contains(&tool_name) {
                debug!(tool = %tool_name, "tool already approved for this session");
                return PermissionDecision::ApprovedForSession;
            }

            let request = PermissionRequest {
                id: id.clone(),
                tool_name,
                args,
                timestamp: Utc::now(),
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            let (respond, decided) = oneshot::channel();
            let displaced = state.pending.insert(
                id.clone(),
                PendingPermission {
                    request: request.clone(),
                    seq,
                    respond,
                },
            );
            (request, seq, displaced, decided)
        };

        if let Some(previous) = displaced {
            warn!(id = %id, "duplicate tool call id, aborting earlier request");
            let _ = previous.respond.send(PermissionDecision::Abort);
            self.finish(previous.request, PermissionDecision::Abort);
        }

        debug!(id = %request.id, tool = %request.tool_name, "permission requested");
        self.sink.emit(PermissionEvent::Requested(request));

        let _guard = PendingGuard {
            negotiator: self,
            id: &id,
            seq,
        };
        match tokio::time::timeout(self.timeout, &mut decided).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => PermissionDecision::Abort,
            Err(_) => {
                let expired = self.take_pending(&id, seq);
                match expired {
                    Some(entry) => {
                        warn!(
                            id = %id,
                            tool = %entry.request.tool_name,
                            timeout_secs = self.timeout.as_secs(),
                            "permission request timed out, denying"
                        );
                        self.finish(entry.request, PermissionDecision::Denied);
                        PermissionDecision::Denied
                    }
                    // A response won the race with the timer.
                    None => decided.try_recv().unwrap_or(PermissionDecision::Abort),
                }
            }
        }
    }

    /// Deliver the remote decision for `id`.
    ///
    /// Returns `false` when `id` is unknown or already resolved.
    pub fn handle_permission_response(&self, id: &str, decision: PermissionDecision) -> bool {
        let Some(entry) = self.lock().pending.remove(id) else {
            debug!(id = %id, "permission response for unknown or resolved request");
            return false;
        };
        let _ = entry.respond.send(decision);
        info!(id = %id, tool = %entry.request.tool_name, ?decision, "permission resolved");
        self.finish(entry.request, decision);
        true
    }

    /// Resolve every pending request to `abort`.
    pub fn reset(&self) -> usize {
        let drained: Vec<PendingPermission> = {
            let mut state = self.lock();
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.respond.send(PermissionDecision::Abort);
            self.finish(entry.request, PermissionDecision::Abort);
        }
        if count > 0 {
            info!(count, "aborted pending permission requests");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        let mut requests: Vec<PermissionRequest> = self
            .lock()
            .pending
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        requests
    }

    /// Most recent completed requests, oldest first.
    pub fn completed(&self) -> Vec<CompletedPermission> {
        self.lock().completed.iter().cloned().collect()
    }

    pub fn is_session_allowed(&self, tool_name: &str) -> bool {
        self.lock().session_allowed.contains(tool_name)
    }

    /// Remove the entry for `id` only if it is still the request numbered `seq`.
    fn take_pending(&self, id: &str, seq: u64) -> Option<PendingPermission> {
        let mut state = self.lock();
        match state.pending.get(id) {
            Some(entry) if entry.seq == seq => state.pending.remove(id),
            _ => None,
        }
    }

    fn finish(&self, request: PermissionRequest, decision: PermissionDecision) {
        let id = request.id.clone();
        self.lock().record(request, decision);
        self.sink.emit(PermissionEvent::Resolved { id, decision });
    }

    fn lock(&self) -> MutexGuard<'_, NegotiatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Aborts a pending request whose waiter went away before it was resolved.
struct PendingGuard<'a> {
    negotiator: &'a PermissionNegotiator,
    id: &'a str,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.negotiator.take_pending(self.id, self.seq) {
            debug!(id = %self.id, "permission wait dropped, aborting request");
            self.negotiator.finish(entry.request, PermissionDecision::Abort);
        }
    }
}

/// `true` when `tool_name` may run in `read-only` mode.
pub fn is_read_only_tool(tool_name: &str) -> bool {
    let name = tool_name.to_ascii_lowercase();
    READ_ONLY_EXACT.contains(&name.as_str())
        || READ_ONLY_FRAGMENTS.iter().any(|frag| name.contains(frag))
}
