//! Process liveness probing and signalling.
//!
//! ## Liveness
//!
//! Liveness is checked using `kill(pid, 0)` on Unix, which probes whether the
//! process exists without sending an actual signal. On non-Unix platforms the
//! check always returns `false` (conservative: treat as dead).
//!
//! ## Escalation
//!
//! [`terminate_with_grace`] implements the shutdown discipline used by the
//! daemon and its clients: SIGTERM every target, poll until the grace period
//! elapses, then SIGKILL whatever is still alive. A target that is already
//! gone counts as terminated.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Signals the control plane sends to agent processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Outcome of delivering a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The signal was delivered.
    Delivered,
    /// The process no longer exists.
    NotFound,
    /// Delivery failed for another reason (e.g. permissions).
    Failed,
}

/// Check whether an OS process with the given PID is alive.
pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        // SAFETY: kill with sig=0 never sends a signal; it only checks PID existence.
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if result == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Send `signal` to `pid`.
pub fn send_signal(pid: u32, signal: Signal) -> SignalOutcome {
    #[cfg(unix)]
    {
        if pid == 0 || pid > i32::MAX as u32 {
            return SignalOutcome::NotFound;
        }
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: plain kill(2) on a positive pid; never targets a process group.
        let result = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if result == 0 {
            return SignalOutcome::Delivered;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(code) if code == libc::ESRCH => SignalOutcome::NotFound,
            _ => SignalOutcome::Failed,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        SignalOutcome::Failed
    }
}

/// Summary of a [`terminate_with_grace`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Exited within the grace period (or were already gone).
    pub exited: Vec<u32>,
    /// Still alive after the grace period and sent SIGKILL.
    pub killed: Vec<u32>,
}

/// SIGTERM every pid, wait up to `grace` for them to exit, then SIGKILL the
/// stragglers.
pub async fn terminate_with_grace(pids: &[u32], grace: Duration) -> TerminationReport {
    let mut report = TerminationReport::default();
    let mut waiting = Vec::new();

    for &pid in pids {
        match send_signal(pid, Signal::Terminate) {
            SignalOutcome::NotFound => report.exited.push(pid),
            SignalOutcome::Delivered => waiting.push(pid),
            SignalOutcome::Failed => {
                warn!(pid, "failed to deliver SIGTERM; will escalate");
                waiting.push(pid);
            }
        }
    }

    let deadline = Instant::now() + grace;
    while !waiting.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waiting.retain(|&pid| {
            if is_pid_alive(pid) {
                true
            } else {
                report.exited.push(pid);
                false
            }
        });
    }

    for pid in waiting {
        debug!(pid, "grace period elapsed; sending SIGKILL");
        if send_signal(pid, Signal::Kill) == SignalOutcome::NotFound {
            report.exited.push(pid);
        } else {
            report.killed.push(pid);
        }
    }

    report
}
