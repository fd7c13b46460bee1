//! Loopback HTTP control server.
//!
//! Binds `127.0.0.1:0` and serves the JSON routes listed in
//! [`happy_core::control`]. Every handler delegates to the shared
//! [`DaemonController`]; malformed request bodies get a `400` with
//! `{success: false, error}` so clients always receive JSON.

use crate::daemon::controller::DaemonController;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use happy_core::control::{
    HealthResponse, ListResponse, ROUTE_HEALTH, ROUTE_LIST, ROUTE_SESSION_STARTED,
    ROUTE_SPAWN_SESSION, ROUTE_STOP, ROUTE_STOP_SESSION, SessionStartedRequest,
    SpawnSessionRequest, StopDaemonResponse, StopSessionRequest, StopSessionResponse,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bind the control listener on an OS-assigned loopback port.
pub async fn bind_loopback() -> std::io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

/// Build the control router.
pub fn router(controller: Arc<DaemonController>) -> Router {
    Router::new()
        .route(ROUTE_LIST, post(list))
        .route(ROUTE_SPAWN_SESSION, post(spawn_session))
        .route(ROUTE_STOP_SESSION, post(stop_session))
        .route(ROUTE_SESSION_STARTED, post(session_started))
        .route(ROUTE_STOP, post(stop_daemon))
        .route(ROUTE_HEALTH, get(health))
        .with_state(controller)
}

/// Serve until `shutdown` is cancelled, letting in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    controller: Arc<DaemonController>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "control server listening");
    axum::serve(listener, router(controller))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("control server stopped");
    Ok(())
}

fn bad_request(rejection: JsonRejection) -> Response {
    debug!(error = %rejection, "rejected control request body");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": rejection.body_text() })),
    )
        .into_response()
}

async fn list(State(ctl): State<Arc<DaemonController>>) -> Json<ListResponse> {
    Json(ListResponse {
        children: ctl.list(),
    })
}

async fn spawn_session(
    State(ctl): State<Arc<DaemonController>>,
    body: Result<Json<SpawnSessionRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(request)) => Json(ctl.spawn_session(&request)).into_response(),
        Err(rejection) => bad_request(rejection),
    }
}

async fn stop_session(
    State(ctl): State<Arc<DaemonController>>,
    body: Result<Json<StopSessionRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(request)) => {
            let success = ctl.stop_session(&request.session_id).await;
            Json(StopSessionResponse { success }).into_response()
        }
        Err(rejection) => bad_request(rejection),
    }
}

async fn session_started(
    State(ctl): State<Arc<DaemonController>>,
    body: Result<Json<SessionStartedRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(request)) => Json(ctl.session_started(&request)).into_response(),
        Err(rejection) => bad_request(rejection),
    }
}

async fn stop_daemon(State(ctl): State<Arc<DaemonController>>) -> Json<StopDaemonResponse> {
    ctl.request_stop();
    Json(StopDaemonResponse {
        status: "stopping".to_string(),
    })
}

async fn health(State(ctl): State<Arc<DaemonController>>) -> Json<HealthResponse> {
    Json(ctl.health())
}
