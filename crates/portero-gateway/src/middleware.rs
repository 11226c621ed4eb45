//! Identity resolution and audit/metrics emission, run on every
//! request.

use crate::state::GatewayState;
use chrono::Utc;
use portero_config::rules::DEFAULT_AGENT;
use portero_core::{PorteroError, PorteroResult};
use portero_security::audit::{AuditRecord, Decision, Operation};
use portero_security::PolicyEngine;
use serde_json::Value;

/// Resolve the caller identity for one request.
///
/// Fallback chain, first hit wins: the `agent_id` argument, then the
/// configured default agent (from `GATEWAY_DEFAULT_AGENT`), then the
/// distinguished `default` agent when it exists and missing identities
/// are tolerated. `Ok(None)` means "unknown agent", which the policy
/// engine resolves to deny-all.
pub fn resolve_agent(
    args: &serde_json::Map<String, Value>,
    default_agent: Option<&str>,
    policy: &PolicyEngine,
) -> PorteroResult<Option<String>> {
    if let Some(value) = args.get("agent_id") {
        if let Some(id) = value.as_str() {
            if !id.is_empty() {
                return Ok(Some(id.to_string()));
            }
        }
    }
    if let Some(fallback) = default_agent {
        if !fallback.is_empty() {
            return Ok(Some(fallback.to_string()));
        }
    }
    if policy.has_default_agent() && !policy.deny_on_missing_agent() {
        return Ok(Some(DEFAULT_AGENT.to_string()));
    }
    if policy.deny_on_missing_agent() {
        return Err(PorteroError::NoAgentIdentity);
    }
    Ok(None)
}

/// Emit the audit record and metrics sample for a finished request.
#[allow(clippy::too_many_arguments)]
pub async fn emit(
    state: &GatewayState,
    agent: Option<&str>,
    operation: Operation,
    server: Option<&str>,
    tool: Option<&str>,
    decision: Decision,
    latency_ms: u64,
    error: Option<String>,
    extra: Option<Value>,
) {
    state.audit.record(AuditRecord {
        ts: Utc::now(),
        agent_id: agent.map(str::to_string),
        operation,
        server: server.map(str::to_string),
        tool: tool.map(str::to_string),
        decision,
        latency_ms,
        error,
        extra,
    });
    state.metrics.record(agent, operation, decision, latency_ms).await;
}

/// Map a request error onto the audited decision.
pub fn decision_for(error: &PorteroError) -> Decision {
    match error {
        PorteroError::AccessDenied(_) | PorteroError::NoAgentIdentity => Decision::Deny,
        _ => Decision::Error,
    }
}
