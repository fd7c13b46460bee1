//! Integration tests for the daemon lifecycle and control surface

#![cfg(unix)]

use happy_core::config::DaemonSettings;
use happy_core::control::{SessionMetadata, SpawnSessionRequest, StartedBy};
use happy_core::daemon_client::{DaemonClient, check_if_daemon_running};
use happy_core::daemon_state::DaemonStateFile;
use happy_core::process::is_pid_alive;
use happy_core::rpc::EncryptionContext;
use happy_daemon::daemon::{DaemonConfig, DaemonHandle, machine_rpc_manager, start_daemon};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(home: &Path) -> DaemonConfig {
    DaemonConfig {
        home: home.to_path_buf(),
        machine_id: "machine-it".to_string(),
        settings: DaemonSettings {
            agent_bin: "sleep".to_string(),
            agent_args: vec!["30".to_string()],
            shutdown_grace_ms: 2000,
            heartbeat_interval_secs: 60,
            orphan_grace_ms: 100,
            request_timeout_secs: 5,
        },
        clean_orphans_on_start: false,
    }
}

async fn start(home: &Path) -> (DaemonHandle, DaemonClient) {
    let handle = start_daemon(test_config(home)).await.unwrap();
    let client = DaemonClient::connect(home, Duration::from_secs(5))
        .unwrap()
        .expect("daemon state should be visible");
    (handle, client)
}

async fn wait_until_dead(pid: u32) {
    for _ in 0..100 {
        if !is_pid_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pid {pid} still alive");
}

#[tokio::test]
async fn test_start_writes_state_and_stop_removes_it() {
    let home = TempDir::new().unwrap();
    let (handle, client) = start(home.path()).await;

    let state = check_if_daemon_running(home.path()).unwrap();
    assert_eq!(state.pid, std::process::id());
    assert_eq!(state.control_port, handle.control_port());

    assert_eq!(client.stop().await.unwrap().status, "stopping");
    handle.wait().await;

    assert!(!DaemonStateFile::in_home(home.path()).path().exists());
}

#[tokio::test]
async fn test_second_start_refuses_and_keeps_state() {
    let home = TempDir::new().unwrap();
    let (handle, _client) = start(home.path()).await;
    let before = DaemonStateFile::in_home(home.path()).read().unwrap().unwrap();

    let err = start_daemon(test_config(home.path())).await.unwrap_err();
    assert!(err.to_string().contains("already running"));

    let after = DaemonStateFile::in_home(home.path()).read().unwrap().unwrap();
    assert_eq!(before, after);

    handle.request_stop();
    handle.wait().await;
}

#[tokio::test]
async fn test_stale_state_is_replaced_on_start() {
    let home = TempDir::new().unwrap();
    std::fs::write(
        DaemonStateFile::in_home(home.path()).path(),
        r#"{"pid": 2147483647, "controlPort": 1}"#,
    )
    .unwrap();

    let (handle, _client) = start(home.path()).await;
    let state = check_if_daemon_running(home.path()).unwrap();
    assert_eq!(state.pid, std::process::id());
    assert_ne!(state.control_port, 1);

    handle.request_stop();
    handle.wait().await;
}

#[tokio::test]
async fn test_spawn_webhook_stop_session_roundtrip() {
    let home = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let (handle, client) = start(home.path()).await;

    let resp = client
        .spawn_session(&SpawnSessionRequest {
            directory: work.path().to_string_lossy().to_string(),
            session_id: None,
            approved_new_directory_creation: false,
        })
        .await
        .unwrap();
    assert!(resp.success);
    let pid = resp.pid.unwrap();
    assert!(pid > 0);

    let listed = client.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].happy_session_id.is_none());

    let ack = client
        .notify_session_started(
            "sess-it",
            SessionMetadata {
                host_pid: Some(pid),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(ack.ok);

    let listed = client.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].pid, pid);
    assert_eq!(listed[0].started_by, StartedBy::Daemon);
    assert_eq!(listed[0].happy_session_id.as_deref(), Some("sess-it"));

    assert!(client.stop_session("sess-it").await.unwrap());
    wait_until_dead(pid).await;
    assert!(client.list().await.unwrap().is_empty());

    handle.request_stop();
    handle.wait().await;
}

#[tokio::test]
async fn test_shutdown_stops_children_before_removing_state() {
    let home = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let (handle, client) = start(home.path()).await;

    let pid = client
        .spawn_session(&SpawnSessionRequest {
            directory: work.path().to_string_lossy().to_string(),
            session_id: None,
            approved_new_directory_creation: false,
        })
        .await
        .unwrap()
        .pid
        .unwrap();

    client.stop().await.unwrap();
    handle.wait().await;

    // The child was signalled during shutdown, before the state file went away.
    wait_until_dead(pid).await;
    assert!(!DaemonStateFile::in_home(home.path()).path().exists());
}

#[tokio::test]
async fn test_machine_rpc_shares_registry_with_http() {
    let home = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let (handle, client) = start(home.path()).await;

    let rpc = machine_rpc_manager(
        handle.controller().clone(),
        "machine-it",
        EncryptionContext::plaintext(),
    );
    let request = rpc
        .build_request(
            "spawn-happy-session",
            &serde_json::json!({"directory": work.path().to_string_lossy()}),
        )
        .unwrap();
    let payload = rpc.dispatch(&request).await.unwrap();
    let resp: serde_json::Value = rpc.encryption().decrypt_json(&payload).unwrap();
    assert_eq!(resp["success"], true);

    let listed = client.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].pid as u64, resp["pid"].as_u64().unwrap());

    handle.request_stop();
    handle.wait().await;
}
