//! Validate-and-swap configuration reload.

use crate::state::GatewayState;
use portero_config::load_and_validate;
use portero_core::PorteroResult;
use portero_security::PolicyEngine;
use tracing::{info, warn};

/// Reload both configuration files.
///
/// On success the new (catalog, policy) pair is published atomically
/// and the proxy registry is reconciled against the new catalog. On any
/// failure the previous snapshot stays live in its entirety and only
/// the reload status records the error. In-flight requests keep the
/// snapshot they captured at dispatch start either way.
pub async fn reload(state: &GatewayState) -> PorteroResult<()> {
    state.record_reload_attempt();
    match load_and_validate(&state.paths.catalog, &state.paths.rules) {
        Ok((catalog, rules)) => {
            let policy = PolicyEngine::new(&rules);
            state.install(catalog.clone(), policy);
            state.proxies.reconcile(&catalog).await;
            state.record_reload_success();
            info!(
                servers = catalog.servers.len(),
                agents = rules.agents.len(),
                "configuration reloaded"
            );
            Ok(())
        }
        Err(e) => {
            state.record_reload_failure(&e.to_string());
            warn!(error = %e, "reload failed; keeping previous configuration");
            Err(e)
        }
    }
}
