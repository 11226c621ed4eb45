//! The Portero gateway server.
//!
//! Speaks MCP as a server to its caller over stdio, exposing a fixed
//! three-tool discovery/dispatch surface (`list_servers`,
//! `get_server_tools`, `execute_tool`, plus `get_gateway_status` in
//! debug mode). Every request runs the middleware pipeline — identity
//! resolution, policy check, argument sanitization, dispatch, audit —
//! against an immutable snapshot of the live configuration, which hot
//! reload replaces atomically.
//!
//! # Main types
//!
//! - [`GatewayState`] — Shared state: snapshot, proxies, audit, metrics.
//! - [`Snapshot`] — One immutable (catalog, policy) pair.
//! - [`run`] — The stdio server loop.
//! - [`reload`] — Validate-and-swap configuration reload.

/// Identity resolution and audit emission.
pub mod middleware;
/// Configuration reload orchestration.
pub mod reload;
/// The stdio MCP server loop.
pub mod server;
/// Live gateway state and snapshots.
pub mod state;
/// The fixed tool surface.
pub mod tools;

pub use reload::reload;
pub use server::run;
pub use state::{ConfigPaths, GatewayOptions, GatewayState, ReloadStatus, Snapshot};
