//! Policy rule types (`.mcp-gateway-rules.json`) and pattern parsing.

use portero_core::{PorteroError, PorteroResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// The distinguished agent id that unknown agents fall back to.
pub const DEFAULT_AGENT: &str = "default";

/// Returns true when `id` is a legal agent id: non-empty, charset
/// `[A-Za-z0-9._-]`.
pub fn valid_agent_id(id: &str) -> bool {
    static AGENT_ID: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    let re = AGENT_ID
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("agent id pattern is constant"));
    re.is_match(id)
}

/// A parsed tool-name pattern.
///
/// The only legal wildcard is a single `*` at the start, at the end, or
/// standing alone; anything else is rejected at validation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolPattern {
    /// `*` — matches every tool name.
    Any,
    /// An exact tool name.
    Literal(String),
    /// `prefix_*` — matches names starting with the prefix.
    Prefix(String),
    /// `*_suffix` — matches names ending with the suffix.
    Suffix(String),
}

impl ToolPattern {
    /// Parse a pattern string. The error is a message fragment; callers
    /// prepend the field path.
    pub fn parse(pattern: &str) -> Result<Self, String> {
        match pattern.matches('*').count() {
            0 => Ok(Self::Literal(pattern.to_string())),
            1 if pattern == "*" => Ok(Self::Any),
            1 if pattern.ends_with('*') => {
                Ok(Self::Prefix(pattern[..pattern.len() - 1].to_string()))
            }
            1 if pattern.starts_with('*') => Ok(Self::Suffix(pattern[1..].to_string())),
            _ => Err(format!(
                "wildcard in pattern \"{pattern}\" must be at start, end, or alone"
            )),
        }
    }

    /// Whether this pattern matches a concrete tool name.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Literal(lit) => name == lit,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
            Self::Suffix(suffix) => name.ends_with(suffix.as_str()),
        }
    }

    /// True for exact-name patterns, which rank above wildcard matches.
    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }
}

/// One allow or deny section of an [`AgentPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSection {
    /// Server-name patterns: literal names or the solitary `*`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
    /// Tool patterns keyed by server name (or `*` for every server).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, Vec<String>>,
}

/// Allow/deny rules for a single agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentPolicy {
    /// What the agent may access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<RuleSection>,
    /// What the agent may never access. Deny wins over allow at equal
    /// precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<RuleSection>,
}

/// Rule-file defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// When true, requests with no resolvable agent identity are
    /// rejected instead of treated as an unknown (deny-all) agent.
    #[serde(default)]
    pub deny_on_missing_agent: bool,
}

/// The full policy rule set: per-agent policies plus defaults.
///
/// Immutable once built; hot reload replaces the whole set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSet {
    /// Per-agent policies, keyed by agent id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<String, AgentPolicy>,
    /// File-wide defaults.
    #[serde(default)]
    pub defaults: Defaults,
}

impl RuleSet {
    /// Build a typed rule set from a pre-validated JSON document.
    pub fn from_value(doc: &serde_json::Value) -> PorteroResult<Self> {
        crate::validate::validate_rules(doc)?;
        serde_json::from_value(doc.clone())
            .map_err(|e| PorteroError::ConfigInvalid(format!("rules: {e}")))
    }

    /// Look up one agent's policy.
    pub fn agent(&self, id: &str) -> Option<&AgentPolicy> {
        self.agents.get(id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_agent_ids() {
        assert!(valid_agent_id("researcher"));
        assert!(valid_agent_id("team.backend_v2-new"));
        assert!(!valid_agent_id(""));
        assert!(!valid_agent_id("agent@corp"));
        assert!(!valid_agent_id("has space"));
    }

    #[test]
    fn test_pattern_parse_literal() {
        assert_eq!(
            ToolPattern::parse("get_user").unwrap(),
            ToolPattern::Literal("get_user".into())
        );
    }

    #[test]
    fn test_pattern_parse_wildcards() {
        assert_eq!(ToolPattern::parse("*").unwrap(), ToolPattern::Any);
        assert_eq!(
            ToolPattern::parse("get_*").unwrap(),
            ToolPattern::Prefix("get_".into())
        );
        assert_eq!(
            ToolPattern::parse("*_query").unwrap(),
            ToolPattern::Suffix("_query".into())
        );
    }

    #[test]
    fn test_pattern_parse_rejects_middle_wildcard() {
        let err = ToolPattern::parse("get_*_all").unwrap_err();
        assert!(err.contains("get_*_all"), "unexpected error: {err}");
        assert!(ToolPattern::parse("a*b*").is_err());
        assert!(ToolPattern::parse("**").is_err());
    }

    #[test]
    fn test_pattern_matching() {
        assert!(ToolPattern::Any.matches("anything"));
        assert!(ToolPattern::Prefix("drop_".into()).matches("drop_table"));
        assert!(!ToolPattern::Prefix("drop_".into()).matches("create_table"));
        assert!(ToolPattern::Suffix("_query".into()).matches("run_query"));
        assert!(!ToolPattern::Suffix("_query".into()).matches("query_runner"));
        assert!(ToolPattern::Literal("exact".into()).matches("exact"));
        assert!(!ToolPattern::Literal("exact".into()).matches("exact2"));
    }

    #[test]
    fn test_rule_set_parse() {
        let rules: RuleSet = serde_json::from_str(
            r#"{"agents":{"backend":{"allow":{"servers":["pg"],"tools":{"pg":["*"]}},"deny":{"tools":{"pg":["drop_*"]}}}},"defaults":{"deny_on_missing_agent":true}}"#,
        )
        .unwrap();
        assert!(rules.defaults.deny_on_missing_agent);
        let backend = rules.agent("backend").unwrap();
        assert_eq!(backend.allow.as_ref().unwrap().servers, vec!["pg"]);
        assert_eq!(
            backend.deny.as_ref().unwrap().tools["pg"],
            vec!["drop_*"]
        );
    }

    #[test]
    fn test_rule_set_defaults_to_empty() {
        let rules: RuleSet = serde_json::from_str("{}").unwrap();
        assert!(rules.agents.is_empty());
        assert!(!rules.defaults.deny_on_missing_agent);
    }
}
