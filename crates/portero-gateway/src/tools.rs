//! The fixed tool surface the gateway exposes to callers.
//!
//! Downstream tool sets are discovered at runtime and flow through as
//! data; only these three (four in debug mode) tools ever appear in the
//! gateway's own `tools/list`.

use crate::state::{GatewayState, Snapshot};
use portero_core::{PorteroError, PorteroResult};
use portero_mcp::{ProxyManager, ToolDescriptor};
use serde_json::{json, Value};

/// The tool definitions registered upstream.
pub fn tool_definitions(debug: bool) -> Vec<ToolDescriptor> {
    let agent_id = json!({
        "type": "string",
        "description": "Caller identity used for policy decisions; falls back to GATEWAY_DEFAULT_AGENT",
    });
    let mut tools = vec![
        ToolDescriptor {
            name: "list_servers".into(),
            description: "List the downstream MCP servers this agent may access".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_id": agent_id,
                    "include_metadata": {
                        "type": "boolean",
                        "description": "Include description and command/url per server",
                        "default": false,
                    },
                },
            }),
        },
        ToolDescriptor {
            name: "get_server_tools".into(),
            description: "List the tools this agent may invoke on one downstream server (\"*\" aggregates all, names prefixed <server>_)".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string", "description": "Downstream server name, or \"*\""},
                    "agent_id": agent_id,
                    "filter": {
                        "type": "string",
                        "description": "Substring match on tool names, or prefix match when ending with *",
                    },
                },
                "required": ["server"],
            }),
        },
        ToolDescriptor {
            name: "execute_tool".into(),
            description: "Invoke a tool on a downstream server and return its result verbatim".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string", "description": "Downstream server name, or \"*\" with a prefixed tool name"},
                    "tool": {"type": "string", "description": "Tool name on that server"},
                    "args": {"type": "object", "description": "Arguments forwarded to the downstream tool"},
                    "agent_id": agent_id,
                },
                "required": ["server", "tool"],
            }),
        },
    ];
    if debug {
        tools.push(ToolDescriptor {
            name: "get_gateway_status".into(),
            description: "Gateway diagnostics: reload status, policy state, downstream lifecycle".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"agent_id": agent_id},
            }),
        });
    }
    tools
}

/// Whether `name` passes the `get_server_tools` filter: substring
/// match, or prefix match when the filter ends with `*`.
fn filter_matches(filter: Option<&str>, name: &str) -> bool {
    match filter {
        None | Some("") => true,
        Some(f) => match f.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name.contains(f),
        },
    }
}

/// `list_servers`: catalog entries filtered to what the agent may see.
pub fn list_servers(snapshot: &Snapshot, agent: &str, include_metadata: bool) -> Value {
    let names = snapshot.catalog.server_names();
    let allowed = snapshot.policy.allowed_servers(agent, &names);
    let servers: Vec<Value> = snapshot
        .catalog
        .servers
        .iter()
        .filter(|(name, _)| allowed.contains(*name))
        .map(|(name, entry)| {
            let mut item = json!({
                "name": name,
                "transport": entry.transport().to_string(),
            });
            if include_metadata {
                if let Some(description) = entry.description() {
                    item["description"] = json!(description);
                }
                match entry {
                    portero_config::ServerEntry::Stdio(s) => item["command"] = json!(s.command),
                    portero_config::ServerEntry::Http(h) => item["url"] = json!(h.url),
                }
            }
            item
        })
        .collect();
    json!({"servers": servers})
}

/// `get_server_tools`: downstream tool schemas filtered by policy and
/// the optional name filter. `server == "*"` aggregates every visible
/// server, prefixing tool names with `<server>_`.
pub async fn get_server_tools(
    state: &GatewayState,
    snapshot: &Snapshot,
    agent: &str,
    server: &str,
    filter: Option<&str>,
) -> PorteroResult<Value> {
    if server == "*" {
        let names = snapshot.catalog.server_names();
        let visible: Vec<String> = snapshot
            .policy
            .allowed_servers(agent, &names)
            .into_iter()
            .collect();
        let prefixed = state
            .proxies
            .enumerate_prefixed(&snapshot.catalog, &visible)
            .await;
        let tools: Vec<Value> = prefixed
            .iter()
            .filter(|tool| {
                let Some((origin, bare)) =
                    ProxyManager::split_prefixed(&snapshot.catalog, &tool.name)
                else {
                    return false;
                };
                snapshot.policy.is_tool_allowed(agent, &origin, &bare)
                    && filter_matches(filter, &tool.name)
            })
            .map(tool_item)
            .collect();
        return Ok(json!({"tools": tools}));
    }

    let entry = snapshot
        .catalog
        .get(server)
        .ok_or_else(|| PorteroError::UnknownServer(server.to_string()))?;
    if !snapshot.policy.is_server_allowed(agent, server) {
        return Err(PorteroError::AccessDenied(format!(
            "agent \"{agent}\" may not access server \"{server}\""
        )));
    }

    let tools = state.proxies.list_tools(server, entry).await?;
    let names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
    let allowed = snapshot.policy.allowed_tools(agent, server, &names);
    let tools: Vec<Value> = tools
        .iter()
        .filter(|tool| allowed.contains(&tool.name) && filter_matches(filter, &tool.name))
        .map(tool_item)
        .collect();
    Ok(json!({"tools": tools}))
}

fn tool_item(tool: &ToolDescriptor) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

/// `execute_tool`: policy-checked dispatch to one downstream tool. The
/// downstream result is returned verbatim.
pub async fn execute_tool(
    state: &GatewayState,
    snapshot: &Snapshot,
    agent: &str,
    server: &str,
    tool: &str,
    args: serde_json::Map<String, Value>,
) -> PorteroResult<Value> {
    let (server, tool) = if server == "*" {
        ProxyManager::split_prefixed(&snapshot.catalog, tool)
            .ok_or_else(|| PorteroError::UnknownServer(format!("no server prefix in \"{tool}\"")))?
    } else {
        (server.to_string(), tool.to_string())
    };

    let entry = snapshot
        .catalog
        .get(&server)
        .ok_or_else(|| PorteroError::UnknownServer(server.clone()))?;
    if !snapshot.policy.is_tool_allowed(agent, &server, &tool) {
        return Err(PorteroError::AccessDenied(format!(
            "agent \"{agent}\" may not call \"{tool}\" on server \"{server}\""
        )));
    }

    state.proxies.call_tool(&server, entry, &tool, args).await
}

/// `get_gateway_status` (debug only): reload, policy, and downstream
/// lifecycle diagnostics.
pub async fn gateway_status(state: &GatewayState, snapshot: &Snapshot) -> Value {
    let lifecycles = state.proxies.states().await;
    let servers: Vec<Value> = snapshot
        .catalog
        .servers
        .iter()
        .map(|(name, entry)| {
            json!({
                "name": name,
                "transport": entry.transport().to_string(),
                "state": lifecycles
                    .get(name)
                    .map_or(json!("pending"), |s| json!(s)),
            })
        })
        .collect();

    json!({
        "reload_status": state.reload_status(),
        "policy_state": {
            "agent_count": snapshot.policy.agent_count(),
            "has_default_agent": snapshot.policy.has_default_agent(),
            "deny_on_missing_agent": snapshot.policy.deny_on_missing_agent(),
        },
        "available_servers": servers,
        "config_paths": {
            "catalog": state.paths.catalog.display().to_string(),
            "rules": state.paths.rules.display().to_string(),
        },
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_definitions_without_debug() {
        let tools = tool_definitions(false);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["list_servers", "get_server_tools", "execute_tool"]);
    }

    #[test]
    fn test_tool_definitions_with_debug() {
        let tools = tool_definitions(true);
        assert!(tools.iter().any(|t| t.name == "get_gateway_status"));
        assert_eq!(tools.len(), 4);
    }

    #[test]
    fn test_filter_matches_substring_and_prefix() {
        assert!(filter_matches(None, "web_search"));
        assert!(filter_matches(Some("search"), "web_search"));
        assert!(!filter_matches(Some("query"), "web_search"));
        assert!(filter_matches(Some("web_*"), "web_search"));
        assert!(!filter_matches(Some("web_*"), "image_search"));
        assert!(filter_matches(Some(""), "anything"));
    }
}
