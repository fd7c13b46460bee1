//! Session-scoped RPC handlers: `bash`, `readFile` and `writeFile`.
//!
//! Every path a handler touches is resolved against the session's working
//! directory and checked with the injected [`PathValidator`] first. Refusals
//! and command failures are returned as `{success: false, error}` results,
//! never as handler errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use happy_core::rpc::RpcHandlerManager;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{debug, warn};

pub const BASH_METHOD: &str = "bash";
pub const READ_FILE_METHOD: &str = "readFile";
pub const WRITE_FILE_METHOD: &str = "writeFile";

/// Result of a path check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathValidation {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PathValidation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// Decides whether a handler may touch `path` for a session rooted at `root`.
pub trait PathValidator: Send + Sync {
    fn validate_path(&self, path: &Path, root: &Path) -> PathValidation;
}

#[derive(Debug, Deserialize)]
struct BashParams {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    /// Milliseconds
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReadFileParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteFileParams {
    path: String,
    /// Base64
    content: String,
}

struct HandlerContext {
    root: PathBuf,
    validator: Arc<dyn PathValidator>,
}

impl HandlerContext {
    /// Resolve `path` against the root and validate it.
    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(path);
        let full = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let check = self.validator.validate_path(&full, &self.root);
        if check.valid {
            Ok(full)
        } else {
            Err(check
                .error
                .unwrap_or_else(|| format!("access to {} denied", full.display())))
        }
    }
}

fn failure(error: impl Into<String>) -> Value {
    json!({ "success": false, "error": error.into() })
}

/// Register the session file and shell handlers on `rpc`.
pub fn register_session_handlers(
    rpc: &RpcHandlerManager,
    root: impl Into<PathBuf>,
    validator: Arc<dyn PathValidator>,
) {
    let ctx = Arc::new(HandlerContext {
        root: root.into(),
        validator,
    });

    let c = Arc::clone(&ctx);
    rpc.register_handler(BASH_METHOD, move |params| {
        let ctx = Arc::clone(&c);
        async move {
            let params: BashParams = serde_json::from_value(params)?;
            Ok::<_, anyhow::Error>(run_bash(&ctx, params).await)
        }
    });

    let c = Arc::clone(&ctx);
    rpc.register_handler(READ_FILE_METHOD, move |params| {
        let ctx = Arc::clone(&c);
        async move {
            let params: ReadFileParams = serde_json::from_value(params)?;
            let path = match ctx.resolve(&params.path) {
                Ok(p) => p,
                Err(e) => return Ok(failure(e)),
            };
            let result = match tokio::fs::read(&path).await {
                Ok(bytes) => json!({ "success": true, "content": STANDARD.encode(bytes) }),
                Err(e) => failure(format!("failed to read {}: {e}", path.display())),
            };
            Ok::<_, anyhow::Error>(result)
        }
    });

    let c = Arc::clone(&ctx);
    rpc.register_handler(WRITE_FILE_METHOD, move |params| {
        let ctx = Arc::clone(&c);
        async move {
            let params: WriteFileParams = serde_json::from_value(params)?;
            let path = match ctx.resolve(&params.path) {
                Ok(p) => p,
                Err(e) => return Ok(failure(e)),
            };
            let bytes = match STANDARD.decode(params.content.as_bytes()) {
                Ok(b) => b,
                Err(e) => return Ok(failure(format!("content is not base64: {e}"))),
            };
            let result = match tokio::fs::write(&path, &bytes).await {
                Ok(()) => {
                    debug!(path = %path.display(), len = bytes.len(), "file written over rpc");
                    json!({ "success": true })
                }
                Err(e) => failure(format!("failed to write {}: {e}", path.display())),
            };
            Ok::<_, anyhow::Error>(result)
        }
    });
}

async fn run_bash(ctx: &HandlerContext, params: BashParams) -> Value {
    let cwd = match params.cwd.as_deref() {
        Some(dir) => match ctx.resolve(dir) {
            Ok(p) => p,
            Err(e) => return failure(e),
        },
        None => ctx.root.clone(),
    };

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&params.command)
        .current_dir(&cwd)
        .kill_on_drop(true);

    let output = match params.timeout {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), command.output()).await {
            Ok(r) => r,
            Err(_) => {
                warn!(command = %params.command, timeout_ms = ms, "bash command timed out");
                return json!({
                    "success": false,
                    "stdout": "",
                    "stderr": "",
                    "exitCode": -1,
                    "error": "Command timed out",
                });
            }
        },
        None => command.output().await,
    };

    match output {
        Ok(out) => {
            let code = out.status.code().unwrap_or(-1);
            json!({
                "success": out.status.success(),
                "stdout": String::from_utf8_lossy(&out.stdout),
                "stderr": String::from_utf8_lossy(&out.stderr),
                "exitCode": code,
            })
        }
        Err(e) => failure(format!("failed to run command: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use happy_core::rpc::{EncryptionContext, RpcRequest};
    use tempfile::TempDir;

    /// Accepts paths lexically under the root.
    struct UnderRoot;

    impl PathValidator for UnderRoot {
        fn validate_path(&self, path: &Path, root: &Path) -> PathValidation {
            if path.starts_with(root) && !path.components().any(|c| c.as_os_str() == "..") {
                PathValidation::ok()
            } else {
                PathValidation::rejected("outside working directory")
            }
        }
    }

    fn manager(root: &Path) -> RpcHandlerManager {
        let rpc = RpcHandlerManager::new("sess-1", EncryptionContext::plaintext());
        register_session_handlers(&rpc, root, Arc::new(UnderRoot));
        rpc
    }

    async fn call(rpc: &RpcHandlerManager, method: &str, params: Value) -> Value {
        let request: RpcRequest = rpc.build_request(method, &params).unwrap();
        let payload = rpc.dispatch(&request).await.unwrap();
        rpc.encryption().decrypt_json(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read_file() {
        let dir = TempDir::new().unwrap();
        let rpc = manager(dir.path());

        let written = call(
            &rpc,
            WRITE_FILE_METHOD,
            json!({"path": "notes.txt", "content": STANDARD.encode("hello")}),
        )
        .await;
        assert_eq!(written["success"], true);
        assert_eq!(std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(), "hello");

        let read = call(&rpc, READ_FILE_METHOD, json!({"path": "notes.txt"})).await;
        assert_eq!(read["success"], true);
        assert_eq!(STANDARD.decode(read["content"].as_str().unwrap()).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_path_outside_root_is_refused() {
        let dir = TempDir::new().unwrap();
        let rpc = manager(dir.path());

        let read = call(&rpc, READ_FILE_METHOD, json!({"path": "/etc/hostname"})).await;
        assert_eq!(read["success"], false);
        assert_eq!(read["error"], "outside working directory");

        let write = call(
            &rpc,
            WRITE_FILE_METHOD,
            json!({"path": "../escape.txt", "content": STANDARD.encode("x")}),
        )
        .await;
        assert_eq!(write["success"], false);
    }

    #[tokio::test]
    async fn test_missing_file_is_structured_failure() {
        let dir = TempDir::new().unwrap();
        let rpc = manager(dir.path());
        let read = call(&rpc, READ_FILE_METHOD, json!({"path": "absent.txt"})).await;
        assert_eq!(read["success"], false);
        assert!(read["error"].as_str().unwrap().contains("failed to read"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bash_runs_in_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let rpc = manager(dir.path());

        let out = call(&rpc, BASH_METHOD, json!({"command": "ls; echo oops >&2; exit 3"})).await;
        assert_eq!(out["success"], false);
        assert_eq!(out["exitCode"], 3);
        assert!(out["stdout"].as_str().unwrap().contains("marker"));
        assert_eq!(out["stderr"], "oops\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bash_timeout() {
        let dir = TempDir::new().unwrap();
        let rpc = manager(dir.path());
        let out = call(&rpc, BASH_METHOD, json!({"command": "sleep 5", "timeout": 50})).await;
        assert_eq!(out["success"], false);
        assert_eq!(out["error"], "Command timed out");
    }

    #[tokio::test]
    async fn test_bad_params_become_error_envelope() {
        let dir = TempDir::new().unwrap();
        let rpc = manager(dir.path());
        let out = call(&rpc, BASH_METHOD, json!({"cmd": "ls"})).await;
        assert_eq!(out["code"], "HANDLER_FAILED");
    }
}
