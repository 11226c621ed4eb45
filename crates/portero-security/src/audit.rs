//! Append-only audit trail: one JSON record per line.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The gateway operation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Enumerate visible servers.
    ListServers,
    /// Enumerate visible tools on one server.
    GetServerTools,
    /// Forward a tool invocation downstream.
    ExecuteTool,
    /// Debug-only gateway status report.
    GetGatewayStatus,
}

impl Operation {
    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListServers => "list_servers",
            Self::GetServerTools => "get_server_tools",
            Self::ExecuteTool => "execute_tool",
            Self::GetGatewayStatus => "get_gateway_status",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The policy outcome recorded for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// The operation was permitted and succeeded.
    Allow,
    /// The policy engine (or identity resolution) rejected it.
    Deny,
    /// The operation was permitted but failed.
    Error,
}

/// One audit record. Every field is serialized on every record; absent
/// values appear as `null`.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// UTC timestamp with fractional seconds.
    pub ts: DateTime<Utc>,
    /// Resolved agent identity, when one was resolved.
    pub agent_id: Option<String>,
    /// The gateway operation.
    pub operation: Operation,
    /// Target server, when the operation names one.
    pub server: Option<String>,
    /// Target tool, when the operation names one.
    pub tool: Option<String>,
    /// Policy outcome.
    pub decision: Decision,
    /// Wall-clock latency of the operation.
    pub latency_ms: u64,
    /// Error kind and detail, for deny/error decisions.
    pub error: Option<String>,
    /// Operation-specific context (e.g. result counts).
    pub extra: Option<serde_json::Value>,
}

/// Append-only audit sink.
///
/// Records are queued on an unbounded channel and written by a single
/// background task, so each line is appended whole and request handling
/// never waits on disk. Sink failures are logged once and never fail
/// the request.
pub struct AuditSink {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl AuditSink {
    /// Create the sink and spawn its writer task. The log file is
    /// `<log_dir>/audit.jsonl`, created on first write.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(dir = %log_dir.display(), error = %e, "audit directory unavailable");
            }
            let path = log_dir.join("audit.jsonl");
            let mut file: Option<tokio::fs::File> = None;
            let mut failure_reported = false;

            while let Some(record) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&record) else {
                    continue;
                };
                line.push('\n');

                if file.is_none() {
                    match tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                    {
                        Ok(f) => file = Some(f),
                        Err(e) => {
                            if !failure_reported {
                                warn!(path = %path.display(), error = %e, "audit log unavailable");
                                failure_reported = true;
                            }
                            continue;
                        }
                    }
                }

                if let Some(f) = file.as_mut() {
                    if let Err(e) = f.write_all(line.as_bytes()).await {
                        if !failure_reported {
                            warn!(path = %path.display(), error = %e, "audit write failed");
                            failure_reported = true;
                        }
                        file = None;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Queue a record for writing. Never blocks, never fails the caller.
    pub fn record(&self, record: AuditRecord) {
        info!(
            agent = record.agent_id.as_deref().unwrap_or("-"),
            operation = %record.operation,
            decision = ?record.decision,
            latency_ms = record.latency_ms,
            "audit"
        );
        let _ = self.tx.send(record);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(decision: Decision) -> AuditRecord {
        AuditRecord {
            ts: Utc::now(),
            agent_id: Some("researcher".into()),
            operation: Operation::ExecuteTool,
            server: Some("brave".into()),
            tool: Some("web_search".into()),
            decision,
            latency_ms: 12,
            error: None,
            extra: None,
        }
    }

    #[test]
    fn test_record_serializes_all_fields() {
        let record = AuditRecord {
            ts: Utc::now(),
            agent_id: None,
            operation: Operation::ListServers,
            server: None,
            tool: None,
            decision: Decision::Allow,
            latency_ms: 0,
            error: None,
            extra: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        // Absent values must appear as explicit nulls.
        assert!(json["agent_id"].is_null());
        assert!(json["server"].is_null());
        assert!(json["error"].is_null());
        assert_eq!(json["operation"], "list_servers");
        assert_eq!(json["decision"], "allow");
    }

    #[test]
    fn test_timestamp_is_utc_iso8601() {
        let record = sample(Decision::Allow);
        let json = serde_json::to_string(&record).unwrap();
        let ts = serde_json::from_str::<serde_json::Value>(&json).unwrap()["ts"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(ts.ends_with('Z'), "not UTC: {ts}");
        assert!(ts.contains('.'), "no fractional seconds: {ts}");
    }

    #[tokio::test]
    async fn test_sink_appends_one_line_per_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = AuditSink::new(dir.path().to_path_buf());
        sink.record(sample(Decision::Allow));
        sink.record(sample(Decision::Deny));

        let path = dir.path().join("audit.jsonl");
        let mut content = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if content.lines().count() == 2 {
                break;
            }
        }
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["agent_id"], "researcher");
        }
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_panic() {
        // Point the sink at a path that cannot be a directory.
        let dir = tempfile::TempDir::new().unwrap();
        let file_path = dir.path().join("occupied");
        tokio::fs::write(&file_path, b"x").await.unwrap();
        let sink = AuditSink::new(file_path);
        sink.record(sample(Decision::Error));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
