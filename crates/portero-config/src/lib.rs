//! Configuration loading and validation for the Portero gateway.
//!
//! Two JSON files drive the gateway: the downstream server catalog
//! (`.mcp.json`) and the per-agent policy rules
//! (`.mcp-gateway-rules.json`). This crate turns both into validated
//! in-memory structures with field-precise error messages, cross-checks
//! rule references against the catalog, and substitutes `${VAR}`
//! environment placeholders in stdio server environments.
//!
//! # Main types
//!
//! - [`Catalog`] — The downstream server catalog.
//! - [`ServerEntry`] — One stdio or HTTP server descriptor.
//! - [`RuleSet`] — Per-agent allow/deny policy rules.
//! - [`ToolPattern`] — A parsed tool-name pattern (`*`, literal, `pre_*`, `*_suf`).
//! - [`CrossCheckWarning`] — A non-fatal mismatch between rules and catalog.

/// Server catalog types and environment substitution.
pub mod catalog;
/// File reading, path resolution, and the combined load pipeline.
pub mod loader;
/// Policy rule types and pattern parsing.
pub mod rules;
/// Structural validation and rules-to-catalog cross-checking.
pub mod validate;

pub use catalog::{Catalog, HttpServer, ServerEntry, StdioServer, Transport};
pub use loader::{load_and_validate, resolve_catalog_path, resolve_rules_path};
pub use rules::{AgentPolicy, Defaults, RuleSection, RuleSet, ToolPattern, DEFAULT_AGENT};
pub use validate::{cross_check, validate_catalog, validate_rules, CrossCheckWarning};
