//! The session abstraction shared by both downstream transports.
//!
//! A session is one initialized MCP connection, leased exclusively to a
//! single in-flight gateway request. Requests and responses therefore
//! never interleave across caller requests on the same connection.

use async_trait::async_trait;
use serde_json::Value;

/// A transport-level session failure, categorized for the error
/// taxonomy. The proxy layer maps these onto [`portero_core::PorteroError`]
/// variants carrying the server name.
#[derive(Debug)]
pub enum SessionError {
    /// The downstream returned a JSON-RPC error object.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },
    /// The transport could not connect, spawn, or exchange bytes.
    Transport(String),
    /// The downstream responded, but not with valid MCP.
    Protocol(String),
    /// Authorization failed or is required.
    Auth(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Auth(msg) => write!(f, "auth: {msg}"),
        }
    }
}

/// One leased downstream MCP session.
#[async_trait]
pub trait McpSession: Send {
    /// Send a JSON-RPC request and await its result payload.
    async fn request(&mut self, method: &str, params: Option<Value>)
        -> Result<Value, SessionError>;

    /// Close the session, releasing its transport resources.
    async fn close(&mut self);
}
