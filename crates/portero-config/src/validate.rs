//! Structural validation of the two config documents, and the
//! rules-to-catalog cross-check.
//!
//! Validation fails fast on the first error and every message names the
//! exact field that is wrong. The cross-check never fails: it returns
//! the full list of warnings so rules can be authored ahead of catalog
//! changes.

use crate::catalog::{Catalog, ServerEntry};
use crate::rules::{valid_agent_id, RuleSet, ToolPattern};
use portero_core::{PorteroError, PorteroResult};
use serde_json::Value;

fn invalid(msg: String) -> PorteroError {
    PorteroError::ConfigInvalid(msg)
}

/// Structurally validate a server catalog document. No I/O.
pub fn validate_catalog(doc: &Value) -> PorteroResult<()> {
    let root = doc
        .as_object()
        .ok_or_else(|| invalid("catalog root must be a JSON object".into()))?;
    let servers = root
        .get("mcpServers")
        .ok_or_else(|| invalid("catalog: missing \"mcpServers\" key".into()))?;
    let servers = servers
        .as_object()
        .ok_or_else(|| invalid("catalog: \"mcpServers\" must be an object".into()))?;

    for (name, desc) in servers {
        let desc = desc
            .as_object()
            .ok_or_else(|| invalid(format!("Server \"{name}\": descriptor must be an object")))?;

        let has_command = desc.contains_key("command");
        let has_url = desc.contains_key("url");
        if has_command == has_url {
            return Err(invalid(format!(
                "Server \"{name}\": must set exactly one of \"command\" or \"url\""
            )));
        }

        if has_command {
            validate_stdio_descriptor(name, desc)?;
        } else {
            validate_http_descriptor(name, desc)?;
        }

        if let Some(d) = desc.get("description") {
            if !d.is_string() {
                return Err(invalid(format!(
                    "Server \"{name}\" description: must be a string"
                )));
            }
        }
    }
    Ok(())
}

fn validate_stdio_descriptor(
    name: &str,
    desc: &serde_json::Map<String, Value>,
) -> PorteroResult<()> {
    for key in desc.keys() {
        if !matches!(key.as_str(), "command" | "args" | "env" | "description") {
            return Err(invalid(format!("Server \"{name}\": unknown key \"{key}\"")));
        }
    }
    if !desc["command"].is_string() {
        return Err(invalid(format!("Server \"{name}\" command: must be a string")));
    }
    if let Some(args) = desc.get("args") {
        let args = args.as_array().ok_or_else(|| {
            invalid(format!("Server \"{name}\" args: must be a list of strings"))
        })?;
        for (i, arg) in args.iter().enumerate() {
            if !arg.is_string() {
                return Err(invalid(format!("Server \"{name}\" args[{i}]: must be a string")));
            }
        }
    }
    if let Some(env) = desc.get("env") {
        validate_string_map(env, &format!("Server \"{name}\" env"))?;
    }
    Ok(())
}

fn validate_http_descriptor(
    name: &str,
    desc: &serde_json::Map<String, Value>,
) -> PorteroResult<()> {
    for key in desc.keys() {
        if !matches!(key.as_str(), "url" | "headers" | "description") {
            return Err(invalid(format!("Server \"{name}\": unknown key \"{key}\"")));
        }
    }
    let url = desc["url"]
        .as_str()
        .ok_or_else(|| invalid(format!("Server \"{name}\" url: must be a string")))?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(invalid(format!(
            "Server \"{name}\" url: must start with http:// or https://"
        )));
    }
    if let Some(headers) = desc.get("headers") {
        validate_string_map(headers, &format!("Server \"{name}\" headers"))?;
    }
    Ok(())
}

fn validate_string_map(value: &Value, context: &str) -> PorteroResult<()> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid(format!("{context}: must be a map of strings")))?;
    for (k, v) in map {
        if !v.is_string() {
            return Err(invalid(format!("{context}[\"{k}\"]: must be a string")));
        }
    }
    Ok(())
}

/// Structurally validate a policy rules document. No I/O.
pub fn validate_rules(doc: &Value) -> PorteroResult<()> {
    let root = doc
        .as_object()
        .ok_or_else(|| invalid("rules root must be a JSON object".into()))?;

    for key in root.keys() {
        if !matches!(key.as_str(), "agents" | "defaults") {
            return Err(invalid(format!("rules: unknown key \"{key}\"")));
        }
    }

    if let Some(agents) = root.get("agents") {
        let agents = agents
            .as_object()
            .ok_or_else(|| invalid("rules: \"agents\" must be an object".into()))?;
        for (id, policy) in agents {
            if !valid_agent_id(id) {
                return Err(invalid(format!(
                    "Agent \"{id}\": id must be non-empty and contain only [A-Za-z0-9._-]"
                )));
            }
            validate_agent_policy(id, policy)?;
        }
    }

    if let Some(defaults) = root.get("defaults") {
        let defaults = defaults
            .as_object()
            .ok_or_else(|| invalid("rules: \"defaults\" must be an object".into()))?;
        for key in defaults.keys() {
            if key != "deny_on_missing_agent" {
                return Err(invalid(format!("defaults: unknown key \"{key}\"")));
            }
        }
        if let Some(v) = defaults.get("deny_on_missing_agent") {
            if !v.is_boolean() {
                return Err(invalid(
                    "defaults.deny_on_missing_agent: must be a boolean".into(),
                ));
            }
        }
    }
    Ok(())
}

fn validate_agent_policy(id: &str, policy: &Value) -> PorteroResult<()> {
    let policy = policy
        .as_object()
        .ok_or_else(|| invalid(format!("Agent \"{id}\": policy must be an object")))?;
    for key in policy.keys() {
        if !matches!(key.as_str(), "allow" | "deny") {
            return Err(invalid(format!("Agent \"{id}\": unknown section \"{key}\"")));
        }
    }
    for section in ["allow", "deny"] {
        if let Some(value) = policy.get(section) {
            validate_rule_section(id, section, value)?;
        }
    }
    Ok(())
}

fn validate_rule_section(id: &str, section: &str, value: &Value) -> PorteroResult<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid(format!("Agent \"{id}\" {section}: must be an object")))?;
    for key in obj.keys() {
        if !matches!(key.as_str(), "servers" | "tools") {
            return Err(invalid(format!(
                "Agent \"{id}\" {section}: unknown key \"{key}\""
            )));
        }
    }

    if let Some(servers) = obj.get("servers") {
        let servers = servers.as_array().ok_or_else(|| {
            invalid(format!(
                "Agent \"{id}\" {section}.servers: must be a list of strings"
            ))
        })?;
        for (i, server) in servers.iter().enumerate() {
            let server = server.as_str().ok_or_else(|| {
                invalid(format!(
                    "Agent \"{id}\" {section}.servers[{i}]: must be a string"
                ))
            })?;
            if server.contains('*') && server != "*" {
                return Err(invalid(format!(
                    "Agent \"{id}\" {section}.servers[{i}]: server wildcard \"{server}\" must stand alone"
                )));
            }
        }
    }

    if let Some(tools) = obj.get("tools") {
        let tools = tools.as_object().ok_or_else(|| {
            invalid(format!(
                "Agent \"{id}\" {section}.tools: must be a map of server name to pattern list"
            ))
        })?;
        for (server, patterns) in tools {
            let patterns = patterns.as_array().ok_or_else(|| {
                invalid(format!(
                    "Agent \"{id}\" {section}.tools[\"{server}\"]: must be a list of patterns"
                ))
            })?;
            for (j, pattern) in patterns.iter().enumerate() {
                let pattern = pattern.as_str().ok_or_else(|| {
                    invalid(format!(
                        "Agent \"{id}\" {section}.tools[\"{server}\"][{j}]: must be a string"
                    ))
                })?;
                if let Err(msg) = ToolPattern::parse(pattern) {
                    return Err(invalid(format!(
                        "Agent \"{id}\" {section}.tools[\"{server}\"][{j}]: {msg}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// A non-fatal mismatch found by [`cross_check`].
#[derive(Debug, Clone, PartialEq)]
pub enum CrossCheckWarning {
    /// A rule references a server name missing from the catalog.
    UndefinedServer {
        /// Agent whose rules reference the server.
        agent: String,
        /// `allow` or `deny`.
        section: &'static str,
        /// The undefined server name.
        server: String,
    },
    /// An HTTP descriptor carries a custom `Authorization` header,
    /// which the OAuth flow will supersede if the downstream activates
    /// it.
    AuthorizationHeader {
        /// The server carrying the header.
        server: String,
    },
}

impl std::fmt::Display for CrossCheckWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UndefinedServer {
                agent,
                section,
                server,
            } => write!(
                f,
                "Agent \"{agent}\" {section} references undefined server \"{server}\""
            ),
            Self::AuthorizationHeader { server } => write!(
                f,
                "Server \"{server}\": custom Authorization header is superseded if the server activates OAuth"
            ),
        }
    }
}

/// Check every server name referenced by the rules against the catalog.
/// Returns the full list of mismatches; never fails.
pub fn cross_check(catalog: &Catalog, rules: &RuleSet) -> Vec<CrossCheckWarning> {
    let mut warnings = Vec::new();

    for (agent, policy) in &rules.agents {
        for (section, rules) in [("allow", &policy.allow), ("deny", &policy.deny)] {
            let Some(rules) = rules else { continue };
            let referenced = rules.servers.iter().chain(rules.tools.keys());
            for server in referenced {
                if server != "*" && catalog.get(server).is_none() {
                    warnings.push(CrossCheckWarning::UndefinedServer {
                        agent: agent.clone(),
                        section,
                        server: server.clone(),
                    });
                }
            }
        }
    }

    for (name, entry) in &catalog.servers {
        if let ServerEntry::Http(http) = entry {
            if http.headers.keys().any(|k| k.eq_ignore_ascii_case("authorization")) {
                warnings.push(CrossCheckWarning::AuthorizationHeader {
                    server: name.clone(),
                });
            }
        }
    }

    warnings
}
