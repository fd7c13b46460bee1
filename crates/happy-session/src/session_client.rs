//! Remote relay collaborator for one session.
//!
//! Transport and key exchange live behind [`SessionClient`]; this crate only
//! sends [`SessionMessage`]s, receives [`UserMessage`]s and registers RPC
//! handlers on the client's session-scoped [`RpcHandlerManager`].

use std::sync::Arc;

use async_trait::async_trait;
use happy_core::rpc::RpcHandlerManager;
use serde::{Deserialize, Serialize};

use crate::backend::AgentMessage;
use crate::mode::PermissionMode;
use crate::permission::PermissionEvent;

/// Optional mode changes carried by a user message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A turn typed by the remote user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: String,
    #[serde(default)]
    pub meta: UserMessageMeta,
}

impl UserMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            meta: UserMessageMeta::default(),
        }
    }
}

/// Outbound session traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "kebab-case")]
pub enum SessionMessage {
    Agent(AgentMessage),
    Permission(PermissionEvent),
    /// The loop finished a batch and is waiting for input.
    Ready,
}

pub type UserMessageHandler = Arc<dyn Fn(UserMessage) + Send + Sync>;

#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn send_message(&self, message: SessionMessage) -> anyhow::Result<()>;

    /// Register the handler for incoming user messages, replacing any earlier one.
    fn on_user_message(&self, handler: UserMessageHandler);

    /// Session-scoped RPC dispatcher.
    fn rpc(&self) -> &RpcHandlerManager;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_message_meta_is_optional() {
        let msg: UserMessage = serde_json::from_value(json!({"text": "hi"})).unwrap();
        assert_eq!(msg, UserMessage::text("hi"));

        let msg: UserMessage = serde_json::from_value(json!({
            "text": "go",
            "meta": {"permissionMode": "read-only", "model": "opus"}
        }))
        .unwrap();
        assert_eq!(msg.meta.permission_mode, Some(PermissionMode::ReadOnly));
        assert_eq!(msg.meta.model.as_deref(), Some("opus"));
    }

    #[test]
    fn test_session_message_tagging() {
        let v = serde_json::to_value(SessionMessage::Ready).unwrap();
        assert_eq!(v, json!({"kind": "ready"}));
    }
}
