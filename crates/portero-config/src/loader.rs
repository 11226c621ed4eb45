//! File reading, path resolution, and the combined load pipeline.

use crate::catalog::Catalog;
use crate::rules::RuleSet;
use crate::validate::{cross_check, validate_catalog, validate_rules};
use portero_core::{PorteroError, PorteroResult};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable naming the catalog file path.
pub const CATALOG_ENV: &str = "GATEWAY_MCP_CONFIG";
/// Environment variable naming the rules file path.
pub const RULES_ENV: &str = "GATEWAY_RULES";

const DEFAULT_CATALOG: &str = ".mcp.json";
const FALLBACK_CATALOG: &str = "config/.mcp.json";
const DEFAULT_RULES: &str = ".mcp-gateway-rules.json";
const FALLBACK_RULES: &str = "config/.mcp-gateway-rules.json";

fn resolve_path(
    explicit: Option<&Path>,
    env_var: &str,
    default: &str,
    fallback: &str,
) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(env_var) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    let default = PathBuf::from(default);
    if default.exists() {
        return default;
    }
    let fallback = PathBuf::from(fallback);
    if fallback.exists() {
        return fallback;
    }
    default
}

/// Resolve the catalog file path: explicit override, then
/// `GATEWAY_MCP_CONFIG`, then `.mcp.json`, then `./config/.mcp.json`.
pub fn resolve_catalog_path(explicit: Option<&Path>) -> PathBuf {
    resolve_path(explicit, CATALOG_ENV, DEFAULT_CATALOG, FALLBACK_CATALOG)
}

/// Resolve the rules file path: explicit override, then `GATEWAY_RULES`,
/// then `.mcp-gateway-rules.json`, then `./config/.mcp-gateway-rules.json`.
pub fn resolve_rules_path(explicit: Option<&Path>) -> PathBuf {
    resolve_path(explicit, RULES_ENV, DEFAULT_RULES, FALLBACK_RULES)
}

fn read_json(path: &Path) -> PorteroResult<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PorteroError::ConfigNotFound(path.display().to_string())
        } else {
            PorteroError::Io(e)
        }
    })?;
    serde_json::from_str(&content)
        .map_err(|e| PorteroError::ConfigInvalid(format!("{}: {e}", path.display())))
}

fn with_path(path: &Path, err: PorteroError) -> PorteroError {
    match err {
        PorteroError::ConfigInvalid(msg) => {
            PorteroError::ConfigInvalid(format!("{}: {msg}", path.display()))
        }
        other => other,
    }
}

/// Read, parse, and validate both config files; log cross-check
/// warnings; substitute `${VAR}` placeholders in the catalog.
///
/// This is the single entry point used at startup and on every reload.
/// Any error leaves the caller's live state untouched.
pub fn load_and_validate(
    catalog_path: &Path,
    rules_path: &Path,
) -> PorteroResult<(Catalog, RuleSet)> {
    let catalog_doc = read_json(catalog_path)?;
    validate_catalog(&catalog_doc).map_err(|e| with_path(catalog_path, e))?;
    let catalog = Catalog::from_value(&catalog_doc).map_err(|e| with_path(catalog_path, e))?;

    let rules_doc = read_json(rules_path)?;
    validate_rules(&rules_doc).map_err(|e| with_path(rules_path, e))?;
    let rules = RuleSet::from_value(&rules_doc).map_err(|e| with_path(rules_path, e))?;

    for warning in cross_check(&catalog, &rules) {
        warn!(warning = %warning, "config cross-check");
    }

    let catalog = catalog.substitute_env()?;
    Ok((catalog, rules))
}
