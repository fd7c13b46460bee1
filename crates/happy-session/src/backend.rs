//! Agent backend collaborator.
//!
//! The agent loop drives a backend through [`AgentBackend`] and never looks at
//! its wire protocol. Backends report progress through one registered
//! [`MessageHandler`], called synchronously for each [`AgentMessage`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed event emitted by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentMessage {
    ModelOutput {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        call_id: String,
        tool_name: String,
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        call_id: String,
        result: Value,
    },
    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Event {
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

pub type MessageHandler = Arc<dyn Fn(AgentMessage) + Send + Sync>;

/// A running agent the loop can prompt.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Start (or restart) a backend session and return its id.
    ///
    /// `model` is the model requested for this session, if any.
    async fn start_session(&self, model: Option<&str>) -> anyhow::Result<String>;

    async fn send_prompt(&self, session_id: &str, text: &str) -> anyhow::Result<()>;

    async fn cancel(&self, session_id: &str) -> anyhow::Result<()>;

    async fn dispose(&self) -> anyhow::Result<()>;

    /// Register the handler for backend messages, replacing any earlier one.
    fn on_message(&self, handler: MessageHandler);
}
