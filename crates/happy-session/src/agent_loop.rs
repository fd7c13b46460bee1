//! The loop joining remote input, the agent backend and permission negotiation.
//!
//! ```text
//! SessionClient ──user msg──▶ MessageQueue ──batch──▶ AgentBackend
//!       ▲                                                  │
//!       └──── SessionMessage (agent output, permission) ◀──┘
//! ```
//!
//! The backend session is restarted only when a batch's mode hash differs
//! from the previous batch's; same-mode batches reuse the running session.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use happy_core::config::SessionSettings;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{AgentBackend, AgentMessage};
use crate::message_queue::{MessageQueue, QueueBatch};
use crate::mode::{EnhancedMode, mode_hash};
use crate::permission::{PermissionDecision, PermissionEvent, PermissionEventSink, PermissionNegotiator};
use crate::session_client::{SessionClient, SessionMessage, UserMessage};

/// Session RPC method carrying a remote permission decision.
pub const PERMISSION_METHOD: &str = "permission";
/// Session RPC method aborting the current turn.
pub const ABORT_METHOD: &str = "abort";

#[derive(Debug, Deserialize)]
struct PermissionResponseParams {
    id: String,
    decision: PermissionDecision,
}

/// Forwards negotiator events into the outbound session channel.
struct OutboundSink(mpsc::UnboundedSender<SessionMessage>);

impl PermissionEventSink for OutboundSink {
    fn emit(&self, event: PermissionEvent) {
        let _ = self.0.send(SessionMessage::Permission(event));
    }
}

/// One session's turn loop.
pub struct AgentLoop {
    queue: Arc<MessageQueue<EnhancedMode>>,
    negotiator: Arc<PermissionNegotiator>,
    backend: Arc<dyn AgentBackend>,
    client: Arc<dyn SessionClient>,
    current_mode: Arc<Mutex<EnhancedMode>>,
    active_session: Arc<Mutex<Option<String>>>,
    outbound_tx: mpsc::UnboundedSender<SessionMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionMessage>>>,
}

impl AgentLoop {
    /// Wire `backend` and `client` together and register the session's
    /// `permission` and `abort` RPC handlers.
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        client: Arc<dyn SessionClient>,
        settings: &SessionSettings,
        initial_mode: EnhancedMode,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let negotiator = Arc::new(PermissionNegotiator::from_settings(
            Arc::new(OutboundSink(outbound_tx.clone())),
            settings,
        ));
        negotiator.set_mode(initial_mode.permission_mode);

        let agent_loop = Self {
            queue: Arc::new(MessageQueue::new(mode_hash)),
            negotiator,
            backend,
            client,
            current_mode: Arc::new(Mutex::new(initial_mode)),
            active_session: Arc::new(Mutex::new(None)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        };
        agent_loop.attach();
        agent_loop
    }

    pub fn queue(&self) -> &Arc<MessageQueue<EnhancedMode>> {
        &self.queue
    }

    pub fn negotiator(&self) -> &Arc<PermissionNegotiator> {
        &self.negotiator
    }

    pub fn current_mode(&self) -> EnhancedMode {
        self.current_mode
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn attach(&self) {
        let queue = Arc::clone(&self.queue);
        let current_mode = Arc::clone(&self.current_mode);
        self.client.on_user_message(Arc::new(move |msg: UserMessage| {
            let mode = {
                let mut mode = current_mode.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(permission_mode) = msg.meta.permission_mode {
                    mode.permission_mode = permission_mode;
                }
                if let Some(model) = msg.meta.model {
                    mode.model = Some(model);
                }
                mode.clone()
            };
            if let Err(e) = queue.push(msg.text, mode) {
                warn!("dropping user message: {e}");
            }
        }));

        let outbound = self.outbound_tx.clone();
        self.backend.on_message(Arc::new(move |msg: AgentMessage| {
            let _ = outbound.send(SessionMessage::Agent(msg));
        }));

        let rpc = self.client.rpc();
        let negotiator = Arc::clone(&self.negotiator);
        rpc.register_handler(PERMISSION_METHOD, move |params| {
            let negotiator = Arc::clone(&negotiator);
            async move {
                let params: PermissionResponseParams = serde_json::from_value(params)?;
                let resolved = negotiator.handle_permission_response(&params.id, params.decision);
                Ok::<_, anyhow::Error>(json!({ "resolved": resolved }))
            }
        });

        let negotiator = Arc::clone(&self.negotiator);
        let backend = Arc::clone(&self.backend);
        let active_session = Arc::clone(&self.active_session);
        rpc.register_handler(ABORT_METHOD, move |_params| {
            let negotiator = Arc::clone(&negotiator);
            let backend = Arc::clone(&backend);
            let active = active_session
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            async move {
                let aborted = negotiator.reset();
                if let Some(session_id) = active {
                    backend.cancel(&session_id).await?;
                }
                Ok::<_, anyhow::Error>(json!({ "aborted": true, "permissions": aborted }))
            }
        });
    }

    /// Consume batches until `cancel` fires or the queue closes.
    ///
    /// On exit every pending permission resolves to `abort`, the backend is
    /// disposed and the queue is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop was already run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent loop already ran"))?;
        let forward_done = CancellationToken::new();
        let forwarder = tokio::spawn(forward_outbound(
            outbound_rx,
            Arc::clone(&self.client),
            forward_done.clone(),
        ));

        let mut session: Option<(String, String)> = None;
        while let Some(batch) = self
            .queue
            .wait_for_messages_and_get_as_string(Some(&cancel))
            .await
        {
            if !self.run_batch(batch, &mut session, &cancel).await {
                break;
            }
            let _ = self.outbound_tx.send(SessionMessage::Ready);
        }

        info!("agent loop exiting");
        self.negotiator.reset();
        self.queue.close();
        self.set_active(None);
        if let Err(e) = self.backend.dispose().await {
            warn!("failed to dispose agent backend: {e:#}");
        }

        forward_done.cancel();
        if let Err(e) = forwarder.await {
            warn!("outbound forwarder failed: {e}");
        }
        Ok(())
    }

    /// Returns `false` when the loop should stop.
    async fn run_batch(
        &self,
        batch: QueueBatch<EnhancedMode>,
        session: &mut Option<(String, String)>,
        cancel: &CancellationToken,
    ) -> bool {
        self.negotiator.set_mode(batch.mode.permission_mode);

        let reuse = session.as_ref().is_some_and(|(_, hash)| *hash == batch.hash);
        if !reuse {
            if let Some((old, _)) = session.take() {
                info!(session_id = %old, "mode changed, restarting backend session");
                if let Err(e) = self.backend.cancel(&old).await {
                    warn!(session_id = %old, "failed to cancel backend session: {e:#}");
                }
            }
            match self.backend.start_session(batch.mode.model.as_deref()).await {
                Ok(id) => {
                    debug!(session_id = %id, model = ?batch.mode.model, "backend session started");
                    *session = Some((id, batch.hash.clone()));
                }
                Err(e) => {
                    error!("failed to start backend session: {e:#}");
                    let _ = self.outbound_tx.send(SessionMessage::Agent(AgentMessage::Status {
                        status: "error".to_string(),
                        detail: Some(format!("{e:#}")),
                    }));
                    return true;
                }
            }
        }
        let Some((session_id, _)) = session.as_ref() else {
            return true;
        };
        let session_id = session_id.clone();
        self.set_active(Some(session_id.clone()));

        let outcome = tokio::select! {
            r = self.backend.send_prompt(&session_id, &batch.message) => Some(r),
            _ = cancel.cancelled() => None,
        };
        self.set_active(None);
        match outcome {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!(session_id = %session_id, "prompt failed: {e:#}");
                true
            }
            None => {
                if let Err(e) = self.backend.cancel(&session_id).await {
                    warn!(session_id = %session_id, "failed to cancel backend session: {e:#}");
                }
                false
            }
        }
    }

    fn set_active(&self, session_id: Option<String>) {
        *self.active_session.lock().unwrap_or_else(|e| e.into_inner()) = session_id;
    }
}

async fn forward_outbound(
    mut rx: mpsc::UnboundedReceiver<SessionMessage>,
    client: Arc<dyn SessionClient>,
    done: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = done.cancelled() => break,
        };
        let Some(msg) = msg else {
            return;
        };
        if let Err(e) = client.send_message(msg).await {
            warn!("failed to send session message: {e:#}");
        }
    }
    while let Ok(msg) = rx.try_recv() {
        if let Err(e) = client.send_message(msg).await {
            warn!("failed to send session message: {e:#}");
        }
    }
}
