//! The downstream server catalog (`.mcp.json`).

use portero_core::{PorteroError, PorteroResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stdio MCP server: spawned as a child process, framed over its
/// stdin/stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StdioServer {
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment merged atop the parent environment. Values may
    /// contain `${VAR}` placeholders, resolved at load time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An HTTP MCP server, optionally OAuth-protected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpServer {
    /// Endpoint URL (`http://` or `https://`).
    pub url: String,
    /// Extra headers sent with every request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One downstream server descriptor: exactly one of stdio or HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEntry {
    /// Child-process transport.
    Stdio(StdioServer),
    /// HTTP transport.
    Http(HttpServer),
}

/// Downstream transport kind, as reported by `list_servers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Child process over stdin/stdout.
    Stdio,
    /// MCP over HTTP.
    Http,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

impl ServerEntry {
    /// The transport this descriptor uses.
    pub fn transport(&self) -> Transport {
        match self {
            Self::Stdio(_) => Transport::Stdio,
            Self::Http(_) => Transport::Http,
        }
    }

    /// The descriptor's human-readable description, if any.
    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Stdio(s) => s.description.as_deref(),
            Self::Http(h) => h.description.as_deref(),
        }
    }
}

/// The downstream server catalog: a name-to-descriptor map.
///
/// Immutable once built; hot reload replaces the whole catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// All configured servers, keyed by name.
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, ServerEntry>,
}

impl Catalog {
    /// Build a typed catalog from a pre-validated JSON document.
    ///
    /// Callers should run [`crate::validate_catalog`] first; this
    /// re-checks structure through serde as a safety net.
    pub fn from_value(doc: &serde_json::Value) -> PorteroResult<Self> {
        crate::validate::validate_catalog(doc)?;
        serde_json::from_value(doc.clone())
            .map_err(|e| PorteroError::ConfigInvalid(format!("catalog: {e}")))
    }

    /// All server names, in catalog (lexicographic) order.
    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.get(name)
    }

    /// Resolve every `${VAR}` placeholder in stdio `env` values against
    /// the process environment. Consumes and returns the catalog so the
    /// unsubstituted form is never kept alive by mistake.
    pub fn substitute_env(mut self) -> PorteroResult<Self> {
        for (name, entry) in &mut self.servers {
            if let ServerEntry::Stdio(stdio) = entry {
                for (key, value) in &mut stdio.env {
                    let context = format!("Server \"{name}\" env[\"{key}\"]");
                    *value = expand_placeholders(value, &context)?;
                }
            }
        }
        Ok(self)
    }
}

/// Expand all `${VAR}` occurrences in `input` from the process
/// environment. `context` names the field for error messages.
fn expand_placeholders(input: &str, context: &str) -> PorteroResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(PorteroError::ConfigInvalid(format!(
                "{context}: unterminated ${{ placeholder"
            )));
        };
        let var = &after[..end];
        match std::env::var(var) {
            Ok(val) => out.push_str(&val),
            Err(_) => {
                return Err(PorteroError::EnvMissing(format!(
                    "{context}: ${{{var}}} is not set"
                )));
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stdio_entry() {
        let entry: ServerEntry = serde_json::from_str(
            r#"{"command":"npx","args":["-y","server-brave"],"env":{"KEY":"v"}}"#,
        )
        .unwrap();
        assert_eq!(entry.transport(), Transport::Stdio);
        match entry {
            ServerEntry::Stdio(s) => {
                assert_eq!(s.command, "npx");
                assert_eq!(s.args, vec!["-y", "server-brave"]);
            }
            ServerEntry::Http(_) => panic!("expected stdio"),
        }
    }

    #[test]
    fn test_parse_http_entry() {
        let entry: ServerEntry = serde_json::from_str(
            r#"{"url":"https://mcp.example.com/sse","headers":{"X-Org":"acme"}}"#,
        )
        .unwrap();
        assert_eq!(entry.transport(), Transport::Http);
    }

    #[test]
    fn test_entry_with_both_command_and_url_rejected() {
        let result: Result<ServerEntry, _> =
            serde_json::from_str(r#"{"command":"psql","url":"https://x.test"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_transport_display() {
        assert_eq!(Transport::Stdio.to_string(), "stdio");
        assert_eq!(Transport::Http.to_string(), "http");
    }

    #[test]
    fn test_substitute_env_replaces_placeholder() {
        std::env::set_var("PORTERO_TEST_SUB_TOKEN", "s3cret");
        let catalog: Catalog = serde_json::from_str(
            r#"{"mcpServers":{"db":{"command":"psql","env":{"TOKEN":"${PORTERO_TEST_SUB_TOKEN}","PLAIN":"x"}}}}"#,
        )
        .unwrap();
        let catalog = catalog.substitute_env().unwrap();
        match catalog.get("db").unwrap() {
            ServerEntry::Stdio(s) => {
                assert_eq!(s.env["TOKEN"], "s3cret");
                assert_eq!(s.env["PLAIN"], "x");
            }
            ServerEntry::Http(_) => panic!("expected stdio"),
        }
    }

    #[test]
    fn test_substitute_env_missing_var() {
        let catalog: Catalog = serde_json::from_str(
            r#"{"mcpServers":{"db":{"command":"psql","env":{"TOKEN":"${PORTERO_TEST_DEFINITELY_UNSET}"}}}}"#,
        )
        .unwrap();
        let err = catalog.substitute_env().unwrap_err();
        assert_eq!(err.kind(), "env_missing");
        let msg = err.to_string();
        assert!(msg.contains("db"), "unexpected error: {msg}");
        assert!(msg.contains("PORTERO_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn test_substitute_env_multiple_placeholders() {
        std::env::set_var("PORTERO_TEST_A", "a");
        std::env::set_var("PORTERO_TEST_B", "b");
        let out =
            expand_placeholders("${PORTERO_TEST_A}:${PORTERO_TEST_B}", "Server \"x\" env[\"K\"]")
                .unwrap();
        assert_eq!(out, "a:b");
    }

    #[test]
    fn test_substitute_env_unterminated() {
        let err = expand_placeholders("${OOPS", "Server \"x\" env[\"K\"]").unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
    }

    #[test]
    fn test_catalog_round_trip() {
        let catalog: Catalog = serde_json::from_str(
            r#"{"mcpServers":{"brave":{"command":"npx","args":["-y","x"]},"api":{"url":"https://mcp.example.com"}}}"#,
        )
        .unwrap();
        let doc = serde_json::to_value(&catalog).unwrap();
        let reparsed = Catalog::from_value(&doc).unwrap();
        assert_eq!(catalog, reparsed);
    }
}
