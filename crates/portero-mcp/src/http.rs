//! HTTP transport — one MCP session per leased connection, with latent
//! OAuth activation on `401 Bearer` challenges.

use crate::oauth::OAuthManager;
use crate::protocol::{initialize_params, InitializeResult, JsonRpcRequest, JsonRpcResponse};
use crate::session::{McpSession, SessionError};
use async_trait::async_trait;
use portero_config::HttpServer;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_HEADER: &str = "Mcp-Session-Id";

/// A single MCP-over-HTTP session.
///
/// The downstream may assign a session id via the `Mcp-Session-Id`
/// response header; it is echoed on every subsequent request of this
/// lease and the session is deleted on close.
pub struct HttpSession {
    server: String,
    url: String,
    headers: BTreeMap<String, String>,
    http: reqwest::Client,
    oauth: Arc<OAuthManager>,
    session_id: Option<String>,
    bearer: Option<String>,
    next_id: u64,
}

impl HttpSession {
    /// Open a session against the configured endpoint and perform the
    /// MCP initialization handshake.
    pub async fn connect(
        server: &str,
        config: &HttpServer,
        http: reqwest::Client,
        oauth: Arc<OAuthManager>,
    ) -> Result<Self, SessionError> {
        let mut session = Self {
            server: server.to_string(),
            url: config.url.clone(),
            headers: config.headers.clone(),
            http,
            oauth,
            session_id: None,
            bearer: None,
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
            "http MCP session initialized"
        );

        session.notify("notifications/initialized").await?;
        Ok(session)
    }

    fn build_post(&self, payload: &Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(self.url.as_str())
            .header("Accept", "application/json, text/event-stream")
            .json(payload);
        for (key, value) in &self.headers {
            // A live OAuth token supersedes any configured Authorization
            // header (known catalog/OAuth conflict).
            if self.bearer.is_some() && key.eq_ignore_ascii_case("authorization") {
                continue;
            }
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(sid) = &self.session_id {
            builder = builder.header(SESSION_HEADER, sid);
        }
        if let Some(token) = &self.bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder
    }

    /// POST a payload, activating OAuth on a `401 Bearer` challenge and
    /// retrying the original request once with the fresh token.
    async fn post(&mut self, payload: &Value) -> Result<reqwest::Response, SessionError> {
        let mut authorized = false;
        loop {
            let send = self.build_post(payload).send();
            let resp = timeout(REQUEST_TIMEOUT, send)
                .await
                .map_err(|_| SessionError::Protocol("request timed out".into()))?
                .map_err(|e| SessionError::Transport(format!("request failed: {e}")))?;

            if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
                let challenge = resp
                    .headers()
                    .get("www-authenticate")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                if authorized {
                    return Err(SessionError::Auth(
                        "still unauthorized after token refresh".into(),
                    ));
                }
                if !challenge.to_ascii_lowercase().starts_with("bearer") {
                    return Err(SessionError::Auth(
                        "unauthorized (401) without a Bearer challenge".into(),
                    ));
                }
                debug!(server = %self.server, "OAuth activated by 401 challenge");
                let token = self
                    .oauth
                    .bearer_token(&self.url)
                    .await
                    .map_err(SessionError::Auth)?;
                self.bearer = Some(token);
                authorized = true;
                continue;
            }

            if !resp.status().is_success() {
                return Err(SessionError::Protocol(format!("HTTP {}", resp.status())));
            }

            if let Some(sid) = resp
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                self.session_id = Some(sid.to_string());
            }
            return Ok(resp);
        }
    }

    async fn notify(&mut self, method: &str) -> Result<(), SessionError> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": {},
        });
        let resp = self.post(&payload).await?;
        // Streamable HTTP answers notifications with 202 and no body.
        let _ = resp.bytes().await;
        Ok(())
    }

    fn parse_body(&self, content_type: &str, text: &str, id: u64) -> Result<JsonRpcResponse, SessionError> {
        if content_type.starts_with("text/event-stream") {
            for line in text.lines() {
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(data.trim()) {
                    if resp.id == Some(id) {
                        return Ok(resp);
                    }
                }
            }
            Err(SessionError::Protocol(
                "no matching response in event stream".into(),
            ))
        } else {
            serde_json::from_str(text)
                .map_err(|e| SessionError::Protocol(format!("bad response body: {e}")))
        }
    }
}

#[async_trait]
impl McpSession for HttpSession {
    async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, SessionError> {
        let id = self.next_id;
        self.next_id += 1;
        let req = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_value(&req)
            .map_err(|e| SessionError::Protocol(format!("failed to serialize request: {e}")))?;

        let resp = self.post(&payload).await?;
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let text = resp
            .text()
            .await
            .map_err(|e| SessionError::Transport(format!("failed to read body: {e}")))?;

        let resp = self.parse_body(&content_type, &text, id)?;
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
        if let Some(sid) = self.session_id.take() {
            let _ = self
                .http
                .delete(self.url.as_str())
                .header(SESSION_HEADER, sid)
                .send()
                .await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn bare_session() -> HttpSession {
        HttpSession {
            server: "test".into(),
            url: "http://127.0.0.1:1/mcp".into(),
            headers: BTreeMap::new(),
            http: reqwest::Client::new(),
            oauth: Arc::new(OAuthManager::new(std::path::PathBuf::from("/tmp/portero-test"))),
            session_id: None,
            bearer: None,
            next_id: 7,
        }
    }

    #[test]
    fn test_parse_plain_json_body() {
        let session = bare_session();
        let resp = session
            .parse_body("application/json", r#"{"jsonrpc":"2.0","id":7,"result":{}}"#, 7)
            .unwrap();
        assert_eq!(resp.id, Some(7));
    }

    #[test]
    fn test_parse_event_stream_body() {
        let session = bare_session();
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\n";
        let resp = session.parse_body("text/event-stream", body, 7).unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[test]
    fn test_parse_event_stream_skips_other_ids() {
        let session = bare_session();
        let body = concat!(
            "data: {\"jsonrpc\":\"2.0\",\"id\":6,\"result\":{}}\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"right\":1}}\n",
        );
        let resp = session.parse_body("text/event-stream", body, 7).unwrap();
        assert_eq!(resp.result.unwrap()["right"], 1);
    }

    #[test]
    fn test_parse_garbage_is_protocol_error() {
        let session = bare_session();
        let err = session.parse_body("application/json", "<html>", 1).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }
}
