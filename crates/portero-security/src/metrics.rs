//! Per-`(agent, operation)` counters and latency tracking.

use crate::audit::{Decision, Operation};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Upper bounds (milliseconds) of the latency histogram buckets; one
/// overflow bucket follows.
pub const LATENCY_BOUNDS_MS: [u64; 10] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000];

/// Counters for one `(agent, operation)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct OpStats {
    /// Total invocations.
    pub total: u64,
    /// Invocations that were permitted and succeeded.
    pub allowed: u64,
    /// Invocations rejected by policy or identity resolution.
    pub denied: u64,
    /// Invocations that were permitted but failed.
    pub errors: u64,
    /// Sum of observed latencies.
    pub latency_sum_ms: u64,
    /// Counts per bucket of [`LATENCY_BOUNDS_MS`], plus overflow.
    pub latency_buckets: [u64; LATENCY_BOUNDS_MS.len() + 1],
}

impl Default for OpStats {
    fn default() -> Self {
        Self {
            total: 0,
            allowed: 0,
            denied: 0,
            errors: 0,
            latency_sum_ms: 0,
            latency_buckets: [0; LATENCY_BOUNDS_MS.len() + 1],
        }
    }
}

impl OpStats {
    fn observe(&mut self, decision: Decision, latency_ms: u64) {
        self.total += 1;
        match decision {
            Decision::Allow => self.allowed += 1,
            Decision::Deny => self.denied += 1,
            Decision::Error => self.errors += 1,
        }
        self.latency_sum_ms += latency_ms;
        let bucket = LATENCY_BOUNDS_MS
            .iter()
            .position(|bound| latency_ms <= *bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.latency_buckets[bucket] += 1;
    }
}

/// In-memory metrics registry.
pub struct Metrics {
    inner: RwLock<HashMap<(String, Operation), OpStats>>,
}

impl Metrics {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Record one operation outcome.
    pub async fn record(
        &self,
        agent: Option<&str>,
        operation: Operation,
        decision: Decision,
        latency_ms: u64,
    ) {
        let key = (agent.unwrap_or("-").to_string(), operation);
        let mut inner = self.inner.write().await;
        inner.entry(key).or_default().observe(decision, latency_ms);
    }

    /// Total invocations across all agents and operations.
    pub async fn total_calls(&self) -> u64 {
        self.inner.read().await.values().map(|s| s.total).sum()
    }

    /// Serialize the registry as JSON, keyed `agent:operation`.
    pub async fn snapshot(&self) -> serde_json::Value {
        let inner = self.inner.read().await;
        let mut map = serde_json::Map::new();
        for ((agent, operation), stats) in inner.iter() {
            let key = format!("{agent}:{operation}");
            if let Ok(value) = serde_json::to_value(stats) {
                map.insert(key, value);
            }
        }
        serde_json::Value::Object(map)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_total() {
        let metrics = Metrics::new();
        metrics
            .record(Some("a"), Operation::ExecuteTool, Decision::Allow, 7)
            .await;
        metrics
            .record(Some("a"), Operation::ExecuteTool, Decision::Deny, 0)
            .await;
        metrics
            .record(None, Operation::ListServers, Decision::Allow, 1)
            .await;
        assert_eq!(metrics.total_calls().await, 3);
    }

    #[tokio::test]
    async fn test_snapshot_keys_and_counters() {
        let metrics = Metrics::new();
        metrics
            .record(Some("backend"), Operation::ExecuteTool, Decision::Error, 120)
            .await;
        let snapshot = metrics.snapshot().await;
        let stats = &snapshot["backend:execute_tool"];
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["errors"], 1);
        assert_eq!(stats["latency_sum_ms"], 120);
    }

    #[tokio::test]
    async fn test_latency_bucketing() {
        let metrics = Metrics::new();
        // 3ms lands in the <=5 bucket; 99_000ms in the overflow bucket.
        metrics
            .record(Some("a"), Operation::ExecuteTool, Decision::Allow, 3)
            .await;
        metrics
            .record(Some("a"), Operation::ExecuteTool, Decision::Allow, 99_000)
            .await;
        let snapshot = metrics.snapshot().await;
        let buckets = snapshot["a:execute_tool"]["latency_buckets"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(buckets[1], 1);
        assert_eq!(buckets[LATENCY_BOUNDS_MS.len()], 1);
    }
}
