//! Core error definitions for the Portero MCP gateway.
//!
//! This crate provides the error type shared across all Portero crates.
//! Every request-visible failure maps onto one of the gateway's error
//! kinds, which appear verbatim in audit records and caller-facing
//! error payloads.
//!
//! # Main types
//!
//! - [`PorteroError`] — Unified error enum for all gateway subsystems.
//! - [`PorteroResult`] — Convenience alias for `Result<T, PorteroError>`.

use thiserror::Error;

/// A convenience `Result` alias using [`PorteroError`].
pub type PorteroResult<T> = Result<T, PorteroError>;

/// Top-level error type for the Portero gateway.
///
/// Variants carrying a `server` field originate from a downstream MCP
/// server and name it; the rest are produced by the gateway itself.
#[derive(Error, Debug)]
pub enum PorteroError {
    /// A configuration file was not found on disk.
    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    /// A configuration file failed to parse or validate.
    #[error("Config error: {0}")]
    ConfigInvalid(String),

    /// A `${VAR}` placeholder referenced an unset environment variable.
    #[error("Environment error: {0}")]
    EnvMissing(String),

    /// No agent identity could be resolved and the rules demand one.
    #[error("No agent identity: pass agent_id, set GATEWAY_DEFAULT_AGENT, or define a \"default\" agent")]
    NoAgentIdentity,

    /// The policy engine denied the request.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The named server is not in the live catalog.
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// A downstream transport could not connect or the child failed to spawn.
    #[error("Server \"{server}\" unreachable: {message}")]
    Unreachable {
        /// Downstream server name.
        server: String,
        /// Transport-level failure detail.
        message: String,
    },

    /// A downstream server produced a malformed or unexpected MCP response.
    #[error("Server \"{server}\" protocol error: {message}")]
    Protocol {
        /// Downstream server name.
        server: String,
        /// Protocol failure detail.
        message: String,
    },

    /// OAuth authorization failed or no usable token is available.
    #[error("Server \"{server}\" auth error: {message}")]
    Auth {
        /// Downstream server name.
        server: String,
        /// Authorization failure detail.
        message: String,
    },

    /// The downstream tool ran but reported a failure.
    #[error("Server \"{server}\" tool error: {message}")]
    ToolError {
        /// Downstream server name.
        server: String,
        /// Error reported by the downstream tool.
        message: String,
    },

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PorteroError {
    /// Stable snake_case kind name, used in audit records and in the
    /// error payloads returned to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigNotFound(_) => "config_not_found",
            Self::ConfigInvalid(_) => "config_invalid",
            Self::EnvMissing(_) => "env_missing",
            Self::NoAgentIdentity => "no_agent_identity",
            Self::AccessDenied(_) => "access_denied",
            Self::UnknownServer(_) => "unknown_server",
            Self::Unreachable { .. } => "downstream_unreachable",
            Self::Protocol { .. } => "downstream_protocol",
            Self::Auth { .. } => "downstream_auth",
            Self::ToolError { .. } => "downstream_tool_error",
            Self::Json(_) | Self::Io(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(PorteroError::NoAgentIdentity.kind(), "no_agent_identity");
        assert_eq!(
            PorteroError::AccessDenied("x".into()).kind(),
            "access_denied"
        );
        assert_eq!(
            PorteroError::Unreachable {
                server: "pg".into(),
                message: "spawn failed".into(),
            }
            .kind(),
            "downstream_unreachable"
        );
    }

    #[test]
    fn test_error_display_names_server() {
        let err = PorteroError::ToolError {
            server: "brave".into(),
            message: "rate limited".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("brave"));
        assert!(msg.contains("rate limited"));
    }
}
