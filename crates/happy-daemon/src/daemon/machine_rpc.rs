//! Machine-scoped RPC handlers.
//!
//! The relay forwards remote calls named `"<machineId>:<method>"` to the
//! daemon. These handlers reuse the [`DaemonController`] behind the HTTP
//! surface, so a phone and a local CLI see identical behaviour:
//!
//! | Method                | Params                                         | Result                    |
//! |-----------------------|------------------------------------------------|---------------------------|
//! | `spawn-happy-session` | `{directory, sessionId?, approvedNewDirectoryCreation?}` | `SpawnSessionResponse` |
//! | `stop-session`        | `{sessionId}`                                  | `{success}`               |
//! | `stop-daemon`         | `{}`                                           | `{status: "stopping"}`    |

use crate::daemon::controller::DaemonController;
use anyhow::Context;
use happy_core::control::{
    SpawnSessionRequest, StopDaemonResponse, StopSessionRequest, StopSessionResponse,
};
use happy_core::rpc::{EncryptionContext, RpcHandlerManager};
use std::sync::Arc;

pub const METHOD_SPAWN_SESSION: &str = "spawn-happy-session";
pub const METHOD_STOP_SESSION: &str = "stop-session";
pub const METHOD_STOP_DAEMON: &str = "stop-daemon";

/// Build the machine-scoped dispatcher for `machine_id`.
pub fn machine_rpc_manager(
    controller: Arc<DaemonController>,
    machine_id: &str,
    encryption: EncryptionContext,
) -> RpcHandlerManager {
    let manager = RpcHandlerManager::new(machine_id, encryption);
    register_machine_handlers(&manager, controller);
    manager
}

/// Register the machine handlers on an existing dispatcher.
pub fn register_machine_handlers(manager: &RpcHandlerManager, controller: Arc<DaemonController>) {
    let ctl = Arc::clone(&controller);
    manager.register_handler(METHOD_SPAWN_SESSION, move |params| {
        let ctl = Arc::clone(&ctl);
        async move {
            let request: SpawnSessionRequest =
                serde_json::from_value(params).context("invalid spawn-happy-session params")?;
            Ok(serde_json::to_value(ctl.spawn_session(&request))?)
        }
    });

    let ctl = Arc::clone(&controller);
    manager.register_handler(METHOD_STOP_SESSION, move |params| {
        let ctl = Arc::clone(&ctl);
        async move {
            let request: StopSessionRequest =
                serde_json::from_value(params).context("invalid stop-session params")?;
            let success = ctl.stop_session(&request.session_id).await;
            Ok(serde_json::to_value(StopSessionResponse { success })?)
        }
    });

    let ctl = controller;
    manager.register_handler(METHOD_STOP_DAEMON, move |_params| {
        let ctl = Arc::clone(&ctl);
        async move {
            ctl.request_stop();
            Ok(serde_json::to_value(StopDaemonResponse {
                status: "stopping".to_string(),
            })?)
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::session_registry::new_session_registry;
    use crate::daemon::spawn::SpawnConfig;
    use happy_core::rpc::RpcErrorEnvelope;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn manager() -> (RpcHandlerManager, Arc<DaemonController>) {
        let ctl = DaemonController::new(
            new_session_registry("machine-r"),
            SpawnConfig {
                agent_bin: "/nonexistent/agent".to_string(),
                agent_args: vec![],
                daemon_pid: std::process::id(),
                control_port: 0,
                machine_id: "machine-r".to_string(),
            },
            Duration::from_millis(200),
            CancellationToken::new(),
        );
        let mgr = machine_rpc_manager(Arc::clone(&ctl), "machine-r", EncryptionContext::plaintext());
        (mgr, ctl)
    }

    async fn call(mgr: &RpcHandlerManager, method: &str, params: Value) -> Value {
        let request = mgr.build_request(method, &params).unwrap();
        let payload = mgr.dispatch(&request).await.unwrap();
        mgr.encryption().decrypt_json(&payload).unwrap()
    }

    #[test]
    fn test_methods_are_machine_scoped() {
        let (mgr, _) = manager();
        assert_eq!(
            mgr.methods(),
            vec![
                "machine-r:spawn-happy-session",
                "machine-r:stop-daemon",
                "machine-r:stop-session",
            ]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_structured() {
        let (mgr, _) = manager();
        let tmp = tempfile::TempDir::new().unwrap();
        let resp = call(
            &mgr,
            METHOD_SPAWN_SESSION,
            json!({"directory": tmp.path().to_str().unwrap()}),
        )
        .await;
        assert_eq!(resp["success"], false);
        assert!(resp["error"].is_string());
    }

    #[tokio::test]
    async fn test_bad_params_become_handler_error() {
        let (mgr, _) = manager();
        let resp = call(&mgr, METHOD_STOP_SESSION, json!({"nope": true})).await;
        let envelope = RpcErrorEnvelope::from_response(&resp).unwrap();
        assert!(envelope.error.contains("invalid stop-session params"));
    }

    #[tokio::test]
    async fn test_stop_daemon_cancels_shutdown_token() {
        let (mgr, ctl) = manager();
        let resp = call(&mgr, METHOD_STOP_DAEMON, json!({})).await;
        assert_eq!(resp["status"], "stopping");
        assert!(ctl.shutdown_token().is_cancelled());
    }
}
