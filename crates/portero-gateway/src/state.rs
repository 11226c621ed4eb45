//! Live gateway state: immutable snapshots, downstream proxies, audit,
//! metrics, and reload bookkeeping.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use portero_config::{Catalog, RuleSet};
use portero_mcp::ProxyManager;
use portero_security::{AuditSink, Metrics, PolicyEngine};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// One immutable (catalog, policy) pair.
///
/// Requests capture the current snapshot at dispatch start and run
/// against it to completion; a concurrent reload never redirects them.
pub struct Snapshot {
    /// The active downstream server catalog.
    pub catalog: Catalog,
    /// The active policy engine.
    pub policy: PolicyEngine,
}

/// Reload bookkeeping, reported by `get_gateway_status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadStatus {
    /// When a reload was last attempted.
    pub last_attempt_ts: Option<DateTime<Utc>>,
    /// When a reload last succeeded.
    pub last_success_ts: Option<DateTime<Utc>>,
    /// The most recent reload error, if the last attempt failed.
    pub last_error_msg: Option<String>,
    /// Successful reloads since startup.
    pub success_count: u64,
    /// Failed reloads since startup.
    pub failure_count: u64,
}

/// The two configuration file paths the gateway watches.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Server catalog path.
    pub catalog: PathBuf,
    /// Policy rules path.
    pub rules: PathBuf,
}

/// Startup options not derived from the config files.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Directory for the audit log.
    pub audit_dir: PathBuf,
    /// Directory for cached OAuth tokens.
    pub token_cache_dir: PathBuf,
    /// Whether `get_gateway_status` is registered.
    pub debug: bool,
    /// Fallback agent identity (`GATEWAY_DEFAULT_AGENT`).
    pub default_agent: Option<String>,
}

/// Shared state threaded through the middleware pipeline.
///
/// The snapshot pointer is the only hot-path shared datum; readers
/// clone the `Arc` under a short read lock, writers publish a new
/// snapshot wholesale. The lock is never held across I/O.
pub struct GatewayState {
    snapshot: RwLock<Arc<Snapshot>>,
    /// Downstream connection registry.
    pub proxies: ProxyManager,
    /// Append-only audit trail.
    pub audit: AuditSink,
    /// Per-agent operation metrics.
    pub metrics: Metrics,
    reload: RwLock<ReloadStatus>,
    /// The watched configuration paths.
    pub paths: ConfigPaths,
    /// Whether debug tools are registered.
    pub debug: bool,
    /// Fallback agent identity captured at startup.
    pub default_agent: Option<String>,
}

impl GatewayState {
    /// Build the initial state from freshly loaded configuration.
    /// Spawns the audit writer task, so this needs a Tokio runtime.
    pub fn new(
        catalog: Catalog,
        rules: &RuleSet,
        paths: ConfigPaths,
        options: GatewayOptions,
    ) -> Self {
        let policy = PolicyEngine::new(rules);
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot { catalog, policy })),
            proxies: ProxyManager::new(options.token_cache_dir),
            audit: AuditSink::new(options.audit_dir),
            metrics: Metrics::new(),
            reload: RwLock::new(ReloadStatus::default()),
            paths,
            debug: options.debug,
            default_agent: options.default_agent,
        }
    }

    /// The current snapshot. Cheap; taken once per request.
    pub fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Atomically publish a new (catalog, policy) pair.
    pub fn install(&self, catalog: Catalog, policy: PolicyEngine) {
        *self.snapshot.write() = Arc::new(Snapshot { catalog, policy });
    }

    /// Current reload bookkeeping.
    pub fn reload_status(&self) -> ReloadStatus {
        self.reload.read().clone()
    }

    /// Stamp a reload attempt.
    pub fn record_reload_attempt(&self) {
        self.reload.write().last_attempt_ts = Some(Utc::now());
    }

    /// Record a successful reload.
    pub fn record_reload_success(&self) {
        let mut status = self.reload.write();
        status.last_success_ts = Some(Utc::now());
        status.last_error_msg = None;
        status.success_count += 1;
    }

    /// Record a failed reload, keeping the live state untouched.
    pub fn record_reload_failure(&self, error: &str) {
        let mut status = self.reload.write();
        status.last_error_msg = Some(error.to_string());
        status.failure_count += 1;
    }
}
