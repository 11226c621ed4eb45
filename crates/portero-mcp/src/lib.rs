//! Downstream MCP connectivity for the Portero gateway.
//!
//! Implements MCP over JSON-RPC 2.0 against downstream tool servers —
//! stdio child processes and HTTP endpoints — plus the OAuth machinery
//! HTTP servers may demand, and the proxy manager that owns every
//! downstream handle.
//!
//! # Main types
//!
//! - [`ProxyManager`] — Owns all downstream handles; forwards calls.
//! - [`ProxyClient`] — One downstream server with its session pool.
//! - [`McpSession`] — A leased, exclusively-held protocol session.
//! - [`OAuthManager`] — Token cache, refresh, and PKCE helpers.

/// HTTP transport session.
pub mod http;
/// OAuth token cache, refresh, and discovery.
pub mod oauth;
/// JSON-RPC 2.0 / MCP message types.
pub mod protocol;
/// Proxy manager and per-server clients.
pub mod proxy;
/// The session abstraction shared by both transports.
pub mod session;
/// Stdio (child process) transport session.
pub mod stdio;

pub use oauth::OAuthManager;
pub use protocol::ToolDescriptor;
pub use proxy::{Lifecycle, ProxyClient, ProxyManager};
pub use session::{McpSession, SessionError};
