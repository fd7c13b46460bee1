//! Orphaned agent recovery.
//!
//! Daemon-spawned agents carry `HAPPY_DAEMON_PID=<pid>` in their environment.
//! When that daemon is gone the agent is an orphan: nothing tracks it and
//! nothing will stop it. The scan finds such processes through `sysinfo`
//! and terminates them with the usual SIGTERM, grace, SIGKILL escalation.

use crate::daemon::spawn::ENV_DAEMON_PID;
use happy_core::process::{TerminationReport, is_pid_alive, terminate_with_grace};
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, RefreshKind, System, UpdateKind};
use tracing::{debug, info};

/// A process carrying a daemon marker whose daemon is dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanProcess {
    pub pid: u32,
    pub daemon_pid: u32,
}

/// Extract the owning daemon pid from a process environment.
pub fn daemon_pid_marker<'a>(environ: impl IntoIterator<Item = &'a str>) -> Option<u32> {
    let prefix = format!("{ENV_DAEMON_PID}=");
    environ
        .into_iter()
        .find_map(|entry| entry.strip_prefix(prefix.as_str()))
        .and_then(|value| value.trim().parse().ok())
}

/// Pick orphans out of `(pid, environ)` pairs.
///
/// `exclude` is the pid of the scanning daemon; its own children are never
/// orphans even if the liveness probe disagrees.
pub fn select_orphans(
    processes: impl IntoIterator<Item = (u32, Vec<String>)>,
    exclude: Option<u32>,
    is_alive: impl Fn(u32) -> bool,
) -> Vec<OrphanProcess> {
    let mut orphans: Vec<OrphanProcess> = processes
        .into_iter()
        .filter_map(|(pid, environ)| {
            let daemon_pid = daemon_pid_marker(environ.iter().map(String::as_str))?;
            if Some(daemon_pid) == exclude || is_alive(daemon_pid) {
                return None;
            }
            Some(OrphanProcess { pid, daemon_pid })
        })
        .collect();
    orphans.sort_by_key(|o| o.pid);
    orphans
}

/// Scan the process table for orphans.
pub fn find_orphans(exclude: Option<u32>) -> Vec<OrphanProcess> {
    let sys = System::new_with_specifics(
        RefreshKind::new()
            .with_processes(ProcessRefreshKind::new().with_environ(UpdateKind::Always)),
    );
    let me = std::process::id();
    let table = sys
        .processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != me)
        .map(|(pid, process)| {
            let environ = process
                .environ()
                .iter()
                .map(|e| e.to_string_lossy().to_string())
                .collect::<Vec<_>>();
            (pid.as_u32(), environ)
        });
    select_orphans(table, exclude, is_pid_alive)
}

/// Find and terminate orphans. Returns what was found and how it went.
pub async fn clean_orphans(
    exclude: Option<u32>,
    grace: Duration,
) -> (Vec<OrphanProcess>, TerminationReport) {
    let orphans = find_orphans(exclude);
    if orphans.is_empty() {
        debug!("no orphaned agent processes");
        return (orphans, TerminationReport::default());
    }

    let pids: Vec<u32> = orphans.iter().map(|o| o.pid).collect();
    info!(?pids, "terminating orphaned agent processes");
    let report = terminate_with_grace(&pids, grace).await;
    (orphans, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_marker_is_parsed() {
        assert_eq!(
            daemon_pid_marker(["PATH=/bin", "HAPPY_DAEMON_PID=812"]),
            Some(812)
        );
        assert_eq!(daemon_pid_marker(["HAPPY_DAEMON_PID=abc"]), None);
        assert_eq!(daemon_pid_marker(["HAPPY_DAEMON_PORT=812"]), None);
    }

    #[test]
    fn test_select_orphans_only_dead_owners() {
        let table = vec![
            (10, env(&["HAPPY_DAEMON_PID=1"])),
            (11, env(&["HAPPY_DAEMON_PID=2"])),
            (12, env(&["HOME=/root"])),
        ];
        let orphans = select_orphans(table, None, |pid| pid == 1);
        assert_eq!(
            orphans,
            vec![OrphanProcess {
                pid: 11,
                daemon_pid: 2
            }]
        );
    }

    #[test]
    fn test_select_orphans_excludes_scanner() {
        let table = vec![(10, env(&["HAPPY_DAEMON_PID=7"]))];
        assert!(select_orphans(table, Some(7), |_| false).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_find_orphans_sees_marked_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .env(ENV_DAEMON_PID, (i32::MAX as u32).to_string())
            .spawn()
            .unwrap();
        let pid = child.id();

        let found = find_orphans(None);
        let _ = child.kill();
        let _ = child.wait();

        assert!(found.iter().any(|o| o.pid == pid));
    }
}
