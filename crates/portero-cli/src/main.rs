//! Portero binary: load configuration, start the watcher, serve MCP on
//! stdio.

mod config_watcher;

use clap::Parser;
use config_watcher::ConfigWatcher;
use portero_config::{load_and_validate, resolve_catalog_path, resolve_rules_path};
use portero_gateway::{ConfigPaths, GatewayOptions, GatewayState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Debounce window for config file change events.
const RELOAD_DEBOUNCE_MS: u64 = 1000;

#[derive(Parser)]
#[command(
    name = "portero",
    version,
    about = "Portero — MCP gateway with per-agent access policy"
)]
struct Cli {
    /// Path to the server catalog (default: GATEWAY_MCP_CONFIG, then
    /// .mcp.json, then ./config/.mcp.json)
    #[arg(long)]
    mcp_config: Option<PathBuf>,

    /// Path to the policy rules (default: GATEWAY_RULES, then
    /// .mcp-gateway-rules.json, then ./config/.mcp-gateway-rules.json)
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Register the get_gateway_status debug tool (or set GATEWAY_DEBUG)
    #[arg(long)]
    debug: bool,

    /// Directory for the audit log
    #[arg(long, default_value = "./data/audit")]
    audit_dir: PathBuf,

    /// Directory for cached OAuth tokens
    #[arg(long, default_value = "./data/tokens")]
    token_cache_dir: PathBuf,
}

fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the MCP protocol; everything else goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let catalog_path = resolve_catalog_path(cli.mcp_config.as_deref());
    let rules_path = resolve_rules_path(cli.rules.as_deref());
    info!(
        catalog = %catalog_path.display(),
        rules = %rules_path.display(),
        "loading configuration"
    );

    // A broken config at startup is fatal; later reload failures are not.
    let (catalog, rules) = load_and_validate(&catalog_path, &rules_path)
        .map_err(|e| anyhow::anyhow!("startup configuration error: {e}"))?;

    let debug_mode = cli.debug || env_truthy("GATEWAY_DEBUG");
    let default_agent = std::env::var("GATEWAY_DEFAULT_AGENT")
        .ok()
        .filter(|v| !v.is_empty());
    info!(
        servers = catalog.servers.len(),
        agents = rules.agents.len(),
        debug = debug_mode,
        "configuration loaded"
    );

    let state = Arc::new(GatewayState::new(
        catalog,
        &rules,
        ConfigPaths {
            catalog: catalog_path.clone(),
            rules: rules_path.clone(),
        },
        GatewayOptions {
            audit_dir: cli.audit_dir,
            token_cache_dir: cli.token_cache_dir,
            debug: debug_mode,
            default_agent,
        },
    ));

    let (reload_tx, reload_rx) = mpsc::unbounded_channel();
    let _watcher = ConfigWatcher::start(
        vec![catalog_path, rules_path],
        RELOAD_DEBOUNCE_MS,
        move || {
            let _ = reload_tx.send(());
        },
    )?;

    portero_gateway::run(state, reload_rx).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_truthy() {
        std::env::set_var("PORTERO_TEST_DEBUG_ON", "TRUE");
        std::env::set_var("PORTERO_TEST_DEBUG_OFF", "0");
        assert!(env_truthy("PORTERO_TEST_DEBUG_ON"));
        assert!(!env_truthy("PORTERO_TEST_DEBUG_OFF"));
        assert!(!env_truthy("PORTERO_TEST_DEBUG_UNSET"));
    }

    #[test]
    fn test_cli_parses_flags() {
        use clap::Parser;
        let cli = Cli::parse_from([
            "portero",
            "--debug",
            "--mcp-config",
            "/etc/portero/.mcp.json",
        ]);
        assert!(cli.debug);
        assert_eq!(
            cli.mcp_config.as_deref(),
            Some(std::path::Path::new("/etc/portero/.mcp.json"))
        );
        assert_eq!(cli.audit_dir, PathBuf::from("./data/audit"));
    }
}
