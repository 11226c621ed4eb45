//! Stdio transport — one MCP session per spawned child process.

use crate::protocol::{initialize_params, InitializeResult, JsonRpcRequest, JsonRpcResponse};
use crate::session::{McpSession, SessionError};
use async_trait::async_trait;
use portero_config::StdioServer;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A single MCP session over a child process's stdin/stdout.
///
/// Each session owns its own child; the proxy pools sessions so that
/// concurrent calls to the same server get separate processes.
#[derive(Debug)]
pub struct StdioSession {
    server: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl StdioSession {
    /// Spawn the configured command and perform the MCP initialization
    /// handshake.
    pub async fn connect(server: &str, config: &StdioServer) -> Result<Self, SessionError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SessionError::Transport(format!("failed to spawn '{}': {e}", config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Transport("child stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Transport("child stdout not available".into()))?;

        let mut session = Self {
            server: server.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
        };

        let init = session
            .request("initialize", Some(initialize_params()))
            .await?;
        let init: InitializeResult = serde_json::from_value(init)
            .map_err(|e| SessionError::Protocol(format!("bad initialize result: {e}")))?;
        info!(
            server = %session.server,
            version = %init.protocol_version,
            "stdio MCP session initialized"
        );

        session.notify("notifications/initialized", None).await?;
        Ok(session)
    }

    async fn write_line(&mut self, payload: &str) -> Result<(), SessionError> {
        self.stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| SessionError::Transport(format!("write failed: {e}")))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| SessionError::Transport(format!("write failed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| SessionError::Transport(format!("flush failed: {e}")))
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_else(|| serde_json::json!({})),
        });
        let payload = msg.to_string();
        self.write_line(&payload).await
    }

    /// Read lines until the response with `id` arrives. Notifications
    /// and non-JSON noise on stdout are skipped.
    async fn read_response(&mut self, id: u64) -> Result<JsonRpcResponse, SessionError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| SessionError::Transport(format!("read failed: {e}")))?;
            if n == 0 {
                return Err(SessionError::Transport("server closed stdout".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == Some(id) => return Ok(resp),
                Ok(_) => continue,
                Err(e) => {
                    debug!(server = %self.server, line = %trimmed, error = %e, "skipping non-response line");
                }
            }
        }
    }
}

#[async_trait]
impl McpSession for StdioSession {
    async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, SessionError> {
        let id = self.next_id;
        self.next_id += 1;
        let req = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_string(&req)
            .map_err(|e| SessionError::Protocol(format!("failed to serialize request: {e}")))?;
        self.write_line(&payload).await?;

        let resp = tokio::time::timeout(REQUEST_TIMEOUT, self.read_response(id))
            .await
            .map_err(|_| SessionError::Protocol(format!("request '{method}' timed out")))??;

        if let Some(err) = resp.error {
            return Err(SessionError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        resp.result
            .ok_or_else(|| SessionError::Protocol(format!("empty result for '{method}'")))
    }

    async fn close(&mut self) {
        let _ = self.child.start_kill();
    }
}
