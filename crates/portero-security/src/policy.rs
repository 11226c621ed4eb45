//! Deny-before-allow policy evaluation over wildcard patterns.
//!
//! Decisions are resolved by strict precedence, highest first:
//!
//! 1. explicit deny (literal entry in the exact server bucket)
//! 2. explicit allow
//! 3. wildcard deny (wildcard pattern, or any entry in the `*` bucket)
//! 4. wildcard allow
//! 5. default deny
//!
//! A tool is allowed only when the server-level check also allows.

use portero_config::rules::{RuleSection, RuleSet, ToolPattern, DEFAULT_AGENT};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::warn;

#[derive(Default)]
struct CompiledSection {
    server_literals: HashSet<String>,
    server_wildcard: bool,
    tools: HashMap<String, Vec<ToolPattern>>,
}

impl CompiledSection {
    fn compile(agent: &str, section: Option<&RuleSection>) -> Self {
        let mut compiled = Self::default();
        let Some(section) = section else {
            return compiled;
        };
        for server in &section.servers {
            if server == "*" {
                compiled.server_wildcard = true;
            } else {
                compiled.server_literals.insert(server.clone());
            }
        }
        for (server, patterns) in &section.tools {
            let parsed: Vec<ToolPattern> = patterns
                .iter()
                .filter_map(|p| match ToolPattern::parse(p) {
                    Ok(pattern) => Some(pattern),
                    Err(e) => {
                        // Rules are validated before they reach the engine;
                        // a programmatically built set may still be malformed.
                        warn!(agent, pattern = %p, error = %e, "skipping invalid tool pattern");
                        None
                    }
                })
                .collect();
            compiled.tools.insert(server.clone(), parsed);
        }
        compiled
    }

    /// Literal match in the exact server bucket (precedence 1/2).
    fn literal_match(&self, server: &str, tool: &str) -> bool {
        self.tools.get(server).is_some_and(|patterns| {
            patterns
                .iter()
                .any(|p| matches!(p, ToolPattern::Literal(lit) if lit == tool))
        })
    }

    /// Wildcard-level match: a wildcard pattern in the exact bucket, or
    /// any pattern in the server-level `*` bucket (precedence 3/4).
    fn wildcard_match(&self, server: &str, tool: &str) -> bool {
        let in_exact_bucket = self.tools.get(server).is_some_and(|patterns| {
            patterns.iter().any(|p| !p.is_literal() && p.matches(tool))
        });
        let in_star_bucket = self
            .tools
            .get("*")
            .is_some_and(|patterns| patterns.iter().any(|p| p.matches(tool)));
        in_exact_bucket || in_star_bucket
    }

    /// Whether any tool rule applies to this server at all.
    fn covers_server(&self, server: &str) -> bool {
        self.tools.contains_key(server) || self.tools.contains_key("*")
    }
}

struct CompiledPolicy {
    allow: CompiledSection,
    deny: CompiledSection,
}

/// The policy engine: an immutable snapshot compiled from a [`RuleSet`].
///
/// Pure and synchronous; every decision is O(patterns for the agent).
/// Replaced wholesale on hot reload, never mutated.
pub struct PolicyEngine {
    agents: HashMap<String, CompiledPolicy>,
    deny_on_missing_agent: bool,
}

impl PolicyEngine {
    /// Compile a rule set into an engine.
    pub fn new(rules: &RuleSet) -> Self {
        let agents = rules
            .agents
            .iter()
            .map(|(id, policy)| {
                let compiled = CompiledPolicy {
                    allow: CompiledSection::compile(id, policy.allow.as_ref()),
                    deny: CompiledSection::compile(id, policy.deny.as_ref()),
                };
                (id.clone(), compiled)
            })
            .collect();
        Self {
            agents,
            deny_on_missing_agent: rules.defaults.deny_on_missing_agent,
        }
    }

    fn policy_for(&self, agent: &str) -> Option<&CompiledPolicy> {
        self.agents
            .get(agent)
            .or_else(|| self.agents.get(DEFAULT_AGENT))
    }

    /// Whether `agent` may see or address `server` at all.
    pub fn is_server_allowed(&self, agent: &str, server: &str) -> bool {
        let Some(policy) = self.policy_for(agent) else {
            return false;
        };
        if policy.deny.server_literals.contains(server) {
            return false;
        }
        if policy.allow.server_literals.contains(server) {
            return true;
        }
        if policy.deny.server_wildcard {
            return false;
        }
        policy.allow.server_wildcard
    }

    /// Whether `agent` may invoke `tool` on `server`. Server denial
    /// dominates: this is false whenever [`Self::is_server_allowed`] is.
    pub fn is_tool_allowed(&self, agent: &str, server: &str, tool: &str) -> bool {
        if !self.is_server_allowed(agent, server) {
            return false;
        }
        let Some(policy) = self.policy_for(agent) else {
            return false;
        };
        if policy.deny.literal_match(server, tool) {
            return false;
        }
        if policy.allow.literal_match(server, tool) {
            return true;
        }
        if policy.deny.wildcard_match(server, tool) {
            return false;
        }
        if policy.allow.wildcard_match(server, tool) {
            return true;
        }
        // A server grant with no tool rules for that server carries full
        // tool access; once an allow bucket covers the server, it is
        // authoritative and unmatched names fall through to deny.
        !policy.allow.covers_server(server)
    }

    /// The subset of `all_servers` visible to `agent`, in order.
    pub fn allowed_servers(&self, agent: &str, all_servers: &[String]) -> BTreeSet<String> {
        all_servers
            .iter()
            .filter(|s| self.is_server_allowed(agent, s))
            .cloned()
            .collect()
    }

    /// The subset of `all_tools` on `server` invocable by `agent`.
    pub fn allowed_tools(
        &self,
        agent: &str,
        server: &str,
        all_tools: &[String],
    ) -> BTreeSet<String> {
        all_tools
            .iter()
            .filter(|t| self.is_tool_allowed(agent, server, t))
            .cloned()
            .collect()
    }

    /// Whether an agent id appears in the rules.
    pub fn has_agent(&self, agent: &str) -> bool {
        self.agents.contains_key(agent)
    }

    /// Whether the distinguished `default` agent is defined.
    pub fn has_default_agent(&self) -> bool {
        self.agents.contains_key(DEFAULT_AGENT)
    }

    /// Number of agents in the rules.
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Whether requests without a resolvable identity are rejected.
    pub fn deny_on_missing_agent(&self) -> bool {
        self.deny_on_missing_agent
    }
}
