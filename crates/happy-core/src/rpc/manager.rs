//! Scope-prefixed RPC dispatcher.
//!
//! One [`RpcHandlerManager`] hosts every handler of a scope. The daemon uses
//! its machine id as the scope, each session uses its session id, so method
//! names like `"<machine>:spawn-happy-session"` and `"<session>:bash"` never
//! collide on a shared relay.
//!
//! [`RpcHandlerManager::dispatch`] never fails because of a handler: unknown
//! methods, undecryptable params, handler errors and handler panics all come
//! back as an encrypted [`RpcErrorEnvelope`].

use super::encryption::{CodecError, EncryptionContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Boxed future returned by a registered handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// An incoming call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Fully scoped method name, `"<scope>:<name>"`
    pub method: String,
    /// `base64(encrypt(json(params)))`
    pub params: String,
}

/// Machine-readable failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    UnknownMethod,
    DecryptFailed,
    InvalidParams,
    HandlerFailed,
    HandlerPanicked,
}

/// Error body returned in place of a handler result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorEnvelope {
    pub error: String,
    pub code: RpcErrorCode,
}

impl RpcErrorEnvelope {
    fn new(code: RpcErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }

    /// Interpret a decrypted response as an error envelope, if it is one.
    pub fn from_response(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() == 2 && obj.contains_key("error") && obj.contains_key("code") {
            serde_json::from_value(value.clone()).ok()
        } else {
            None
        }
    }
}

/// Dispatcher for one scope.
pub struct RpcHandlerManager {
    scope_prefix: String,
    encryption: EncryptionContext,
    handlers: RwLock<HashMap<String, Handler>>,
}

impl std::fmt::Debug for RpcHandlerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHandlerManager")
            .field("scope_prefix", &self.scope_prefix)
            .field("methods", &self.methods())
            .finish_non_exhaustive()
    }
}

impl RpcHandlerManager {
    pub fn new(scope_prefix: impl Into<String>, encryption: EncryptionContext) -> Self {
        Self {
            scope_prefix: scope_prefix.into(),
            encryption,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn scope_prefix(&self) -> &str {
        &self.scope_prefix
    }

    pub fn encryption(&self) -> &EncryptionContext {
        &self.encryption
    }

    /// Fully scoped name of `method`.
    pub fn scoped(&self, method: &str) -> String {
        format!("{}:{}", self.scope_prefix, method)
    }

    /// Register `handler` for `method` (unscoped). Replaces any previous
    /// handler of the same name.
    pub fn register_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let scoped = self.scoped(method);
        let boxed: Handler = Arc::new(move |params| -> HandlerFuture { Box::pin(handler(params)) });
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(scoped.clone(), boxed).is_some() {
            debug!(method = %scoped, "replaced rpc handler");
        } else {
            debug!(method = %scoped, "registered rpc handler");
        }
    }

    /// Remove the handler for `method`. Returns `true` if one was registered.
    pub fn unregister_handler(&self, method: &str) -> bool {
        let scoped = self.scoped(method);
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(&scoped).is_some()
    }

    pub fn has_handler(&self, method: &str) -> bool {
        let scoped = self.scoped(method);
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(&scoped)
    }

    /// Sorted scoped names of every registered method, for re-announcing
    /// after a reconnect.
    pub fn methods(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Decrypt, route, invoke and encrypt.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] only when the response itself cannot be
    /// encrypted. Every other failure is reported inside the payload.
    pub async fn dispatch(&self, request: &RpcRequest) -> Result<String, CodecError> {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&request.method).cloned()
        };
        let Some(handler) = handler else {
            warn!(method = %request.method, "rpc call for unknown method");
            return self.encryption.encrypt_json(&RpcErrorEnvelope::new(
                RpcErrorCode::UnknownMethod,
                format!("Method not found: {}", request.method),
            ));
        };

        let params: Value = match self.encryption.decrypt_json(&request.params) {
            Ok(v) => v,
            Err(CodecError::Json(e)) => {
                warn!(method = %request.method, error = %e, "rpc params are not JSON");
                return self.encryption.encrypt_json(&RpcErrorEnvelope::new(
                    RpcErrorCode::InvalidParams,
                    e.to_string(),
                ));
            }
            Err(e) => {
                warn!(method = %request.method, error = %e, "failed to decrypt rpc params");
                return self.encryption.encrypt_json(&RpcErrorEnvelope::new(
                    RpcErrorCode::DecryptFailed,
                    e.to_string(),
                ));
            }
        };

        // Run on its own task so a panicking handler surfaces as a JoinError.
        let outcome = tokio::spawn(handler(params)).await;
        match outcome {
            Ok(Ok(result)) => {
                debug!(method = %request.method, "rpc call completed");
                self.encryption.encrypt_json(&result)
            }
            Ok(Err(e)) => {
                warn!(method = %request.method, error = %e, "rpc handler failed");
                self.encryption.encrypt_json(&RpcErrorEnvelope::new(
                    RpcErrorCode::HandlerFailed,
                    format!("{e:#}"),
                ))
            }
            Err(join) => {
                warn!(method = %request.method, error = %join, "rpc handler panicked");
                self.encryption.encrypt_json(&RpcErrorEnvelope::new(
                    RpcErrorCode::HandlerPanicked,
                    "handler panicked",
                ))
            }
        }
    }

    /// Build a request for `method` of this scope with `params` encrypted.
    pub fn build_request<T: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &T,
    ) -> Result<RpcRequest, CodecError> {
        Ok(RpcRequest {
            method: self.scoped(method),
            params: self.encryption.encrypt_json(params)?,
        })
    }
}
