//! Daemon startup and lifecycle.
//!
//! Startup sequence:
//! 1. refuse if a live daemon owns the state file (stale state self-heals)
//! 2. bind the loopback control port; failure here is the only fatal fault
//! 3. claim the state file with the bound port
//! 4. start the control server, heartbeat and a one-shot orphan scan
//!
//! The returned [`DaemonHandle`] resolves once shutdown is complete.

use crate::daemon::control_server::{bind_loopback, serve};
use crate::daemon::controller::DaemonController;
use crate::daemon::heartbeat::heartbeat_loop;
use crate::daemon::orphans::clean_orphans;
use crate::daemon::session_registry::new_session_registry;
use crate::daemon::shutdown::graceful_shutdown;
use crate::daemon::spawn::SpawnConfig;
use happy_core::config::DaemonSettings;
use happy_core::daemon_state::{DaemonState, DaemonStateFile};
use happy_core::error::DaemonError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything the daemon needs to start.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// `HAPPY_HOME`; the state file lives here
    pub home: PathBuf,
    pub machine_id: String,
    pub settings: DaemonSettings,
    /// Run the orphan scan once after startup
    pub clean_orphans_on_start: bool,
}

/// A running daemon.
#[derive(Debug)]
pub struct DaemonHandle {
    state: DaemonState,
    controller: Arc<DaemonController>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    pub fn control_port(&self) -> u16 {
        self.state.control_port
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    pub fn controller(&self) -> &Arc<DaemonController> {
        &self.controller
    }

    /// Token that triggers shutdown when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn request_stop(&self) {
        self.controller.request_stop();
    }

    /// Wait until shutdown has finished and the state file is gone.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "daemon supervisor task panicked");
        }
    }
}

/// Start the daemon.
///
/// # Errors
///
/// - [`DaemonError::AlreadyRunning`] if a live daemon owns the state file;
///   that daemon's state is left untouched
/// - [`DaemonError::Bind`] if the control port cannot be bound
/// - [`DaemonError::Io`] / [`DaemonError::Json`] if the state file cannot be
///   written
pub async fn start_daemon(config: DaemonConfig) -> Result<DaemonHandle, DaemonError> {
    let state_file = DaemonStateFile::in_home(&config.home);
    state_file.check_existing()?;

    let (listener, addr) = bind_loopback()
        .await
        .map_err(|source| DaemonError::Bind { source })?;

    let state = DaemonState::for_current_process(addr.port());
    state_file.claim(&state)?;
    info!(pid = state.pid, port = state.control_port, "daemon started");

    let cancel = CancellationToken::new();
    let registry = new_session_registry(config.machine_id.clone());
    let controller = DaemonController::new(
        Arc::clone(&registry),
        SpawnConfig {
            agent_bin: config.settings.agent_bin.clone(),
            agent_args: config.settings.agent_args.clone(),
            daemon_pid: state.pid,
            control_port: state.control_port,
            machine_id: config.machine_id.clone(),
        },
        config.settings.shutdown_grace(),
        cancel.clone(),
    );

    if config.clean_orphans_on_start {
        let grace = config.settings.orphan_grace();
        let own_pid = state.pid;
        tokio::spawn(async move {
            let (orphans, report) = clean_orphans(Some(own_pid), grace).await;
            if !orphans.is_empty() {
                info!(
                    found = orphans.len(),
                    killed = report.killed.len(),
                    "orphan scan complete"
                );
            }
        });
    }

    let heartbeat = tokio::spawn(heartbeat_loop(
        Arc::clone(&registry),
        state_file.clone(),
        state.pid,
        config.settings.heartbeat_interval(),
        cancel.clone(),
    ));

    let server_ctl = Arc::clone(&controller);
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let result = serve(listener, server_ctl, server_cancel.clone()).await;
        // A server that dies on its own still takes the daemon down cleanly.
        server_cancel.cancel();
        result
    });

    let supervisor_cancel = cancel.clone();
    let grace = config.settings.shutdown_grace();
    let own_pid = state.pid;
    let task = tokio::spawn(async move {
        supervisor_cancel.cancelled().await;

        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "control server exited with error"),
            Err(e) => warn!(error = %e, "control server task panicked"),
        }
        let _ = heartbeat.await;

        graceful_shutdown(&registry, &state_file, own_pid, grace).await;
        info!("daemon stopped");
    });

    Ok(DaemonHandle {
        state,
        controller,
        cancel,
        task,
    })
}
