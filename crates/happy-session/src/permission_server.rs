//! MCP-style tool server exposing the [`PermissionNegotiator`] to the agent
//! backend over stdio.
//!
//! The backend calls the single `permission_prompt` tool before running any
//! other tool. The call result is always a successful JSON-RPC response whose
//! text content is a JSON decision object:
//!
//! ```json
//! {"behavior": "allow", "updatedInput": {"command": "ls"}}
//! {"behavior": "deny", "message": "Permission denied"}
//! ```
//!
//! Calls are served concurrently; a slow approval never blocks `tools/list`
//! or other calls.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::framing::{FrameReader, Framing, write_frame};
use crate::permission::{PermissionDecision, PermissionNegotiator};

/// Name of the one tool served.
pub const PERMISSION_TOOL_NAME: &str = "permission_prompt";

const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "happy-permission";

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Arguments of a `permission_prompt` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionPromptArgs {
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

/// Decision payload returned to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionReply {
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },
    Deny {
        message: String,
    },
}

impl PermissionReply {
    pub fn from_decision(decision: PermissionDecision, input: Value) -> Self {
        match decision {
            PermissionDecision::Approved | PermissionDecision::ApprovedForSession => {
                PermissionReply::Allow {
                    updated_input: input,
                }
            }
            PermissionDecision::Denied => PermissionReply::Deny {
                message: "Permission denied".to_string(),
            },
            PermissionDecision::Abort => PermissionReply::Deny {
                message: "Permission request aborted".to_string(),
            },
        }
    }
}

/// Schema of the `permission_prompt` tool as listed by `tools/list`.
pub fn permission_tool_schema() -> Value {
    json!({
        "name": PERMISSION_TOOL_NAME,
        "description": "Ask the remote user whether a tool call may run",
        "inputSchema": {
            "type": "object",
            "properties": {
                "tool_name": {
                    "type": "string",
                    "description": "Name of the tool about to run"
                },
                "input": {
                    "type": "object",
                    "description": "Arguments the tool will be called with"
                },
                "tool_use_id": {
                    "type": "string",
                    "description": "Backend id of the tool call"
                }
            },
            "required": ["tool_name", "input"]
        }
    })
}

/// Stdio JSON-RPC server around a shared negotiator.
#[derive(Debug, Clone)]
pub struct PermissionToolServer {
    negotiator: Arc<PermissionNegotiator>,
}

impl PermissionToolServer {
    pub fn new(negotiator: Arc<PermissionNegotiator>) -> Self {
        Self { negotiator }
    }

    /// Serve requests from `input` until EOF, writing replies to `output`.
    ///
    /// Replies to calls still in flight at EOF are written before returning.
    /// Reading stays in step with the stream while replies are written, since
    /// [`FrameReader::next_message`] keeps partial frames across cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error when reading a frame fails.
    pub async fn run<R, W>(&self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = FrameReader::new(input);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<(Value, Framing)>();
        let mut reading = true;
        let mut reply_tx = Some(reply_tx);

        loop {
            tokio::select! {
                result = reader.next_message(), if reading => {
                    let Some((raw, framing)) = result? else {
                        debug!("permission server input closed");
                        reading = false;
                        reply_tx = None;
                        continue;
                    };
                    let msg: Value = match serde_json::from_str(&raw) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("failed to parse permission server request: {e}");
                            continue;
                        }
                    };
                    if let Some(tx) = reply_tx.as_ref() {
                        self.handle_message(msg, framing, tx);
                    }
                }
                reply = reply_rx.recv() => {
                    let Some((reply, framing)) = reply else {
                        break;
                    };
                    let serialized = reply.to_string();
                    if let Err(e) = write_frame(&mut output, &serialized, framing).await {
                        warn!("failed to write permission server reply: {e}");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_message(&self, msg: Value, framing: Framing, replies: &mpsc::UnboundedSender<(Value, Framing)>) {
        let method = msg.get("method").and_then(Value::as_str).unwrap_or_default();
        let Some(id) = msg.get("id").cloned() else {
            debug!(method, "ignoring notification");
            return;
        };
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => {
                let version = params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_PROTOCOL_VERSION);
                let result = json!({
                    "protocolVersion": version,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                });
                let _ = replies.send((make_result(id, result), framing));
            }
            "ping" => {
                let _ = replies.send((make_result(id, json!({})), framing));
            }
            "tools/list" => {
                let result = json!({ "tools": [permission_tool_schema()] });
                let _ = replies.send((make_result(id, result), framing));
            }
            "tools/call" => self.spawn_tool_call(id, params, framing, replies.clone()),
            other => {
                debug!(method = other, "unsupported permission server method");
                let reply = make_error_response(id, METHOD_NOT_FOUND, &format!("method not found: {other}"));
                let _ = replies.send((reply, framing));
            }
        }
    }

    fn spawn_tool_call(
        &self,
        id: Value,
        params: Value,
        framing: Framing,
        replies: mpsc::UnboundedSender<(Value, Framing)>,
    ) {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        if name != PERMISSION_TOOL_NAME {
            let reply = make_error_response(id, INVALID_PARAMS, &format!("unknown tool: {name}"));
            let _ = replies.send((reply, framing));
            return;
        }
        let args: PermissionPromptArgs =
            match serde_json::from_value(params.get("arguments").cloned().unwrap_or(Value::Null)) {
                Ok(args) => args,
                Err(e) => {
                    warn!("malformed permission_prompt arguments: {e}");
                    let reply = PermissionReply::Deny {
                        message: format!("invalid arguments: {e}"),
                    };
                    let _ = replies.send((make_tool_result(id, &reply), framing));
                    return;
                }
            };

        let negotiator = Arc::clone(&self.negotiator);
        tokio::spawn(async move {
            let call_id = args
                .tool_use_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let decision = negotiator
                .handle_tool_call(call_id.clone(), args.tool_name.clone(), args.input.clone())
                .await;
            info!(id = %call_id, tool = %args.tool_name, ?decision, "answered permission prompt");

            let reply = PermissionReply::from_decision(decision, args.input);
            let _ = replies.send((make_tool_result(id, &reply), framing));
        });
    }
}

fn make_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Successful `tools/call` response carrying `reply` as its text content.
fn make_tool_result(id: Value, reply: &PermissionReply) -> Value {
    let text = serde_json::to_string(reply).unwrap_or_default();
    make_result(id, json!({ "content": [{ "type": "text", "text": text }] }))
}

/// Construct a JSON-RPC error response.
pub fn make_error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_wire_shape() {
        let allow = PermissionReply::from_decision(PermissionDecision::Approved, json!({"command": "ls"}));
        assert_eq!(
            serde_json::to_value(&allow).unwrap(),
            json!({"behavior": "allow", "updatedInput": {"command": "ls"}})
        );

        let deny = PermissionReply::from_decision(PermissionDecision::Abort, json!({}));
        let v = serde_json::to_value(&deny).unwrap();
        assert_eq!(v["behavior"], "deny");
        assert!(v["message"].as_str().unwrap().contains("aborted"));
    }

    #[test]
    fn test_prompt_args_optional_id() {
        let args: PermissionPromptArgs =
            serde_json::from_value(json!({"tool_name": "Bash", "input": {"command": "ls"}})).unwrap();
        assert_eq!(args.tool_name, "Bash");
        assert!(args.tool_use_id.is_none());
    }

    #[test]
    fn test_tool_schema_name() {
        assert_eq!(permission_tool_schema()["name"], PERMISSION_TOOL_NAME);
    }
}
