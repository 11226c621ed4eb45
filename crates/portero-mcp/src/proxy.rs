//! The proxy manager — owns every downstream handle, forwards calls,
//! and keeps caller requests sessionally isolated.

use crate::http::HttpSession;
use crate::oauth::OAuthManager;
use crate::protocol::ToolDescriptor;
use crate::session::{McpSession, SessionError};
use crate::stdio::StdioSession;
use portero_config::{Catalog, ServerEntry};
use portero_core::{PorteroError, PorteroResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// The reserved argument carrying the caller identity. Stripped before
/// any call is forwarded downstream.
pub const RESERVED_AGENT_ARG: &str = "agent_id";

/// Idle sessions kept per server; extras are closed on release.
const MAX_IDLE_SESSIONS: usize = 4;

/// Lifecycle state of a downstream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Created but never connected.
    Pending,
    /// Connected at least once.
    Ready,
    /// Last connection attempt failed; retried on next use.
    Failed,
    /// Removed from the catalog or gateway exiting.
    Shutdown,
}

/// Remove the reserved identity argument from a forwarded argument map.
pub fn sanitize_arguments(args: &mut serde_json::Map<String, Value>) {
    args.remove(RESERVED_AGENT_ARG);
}

/// A gateway-held handle to one downstream server.
///
/// Sessions are pooled: each in-flight call leases one exclusively, so
/// concurrent calls to the same server never share protocol state.
pub struct ProxyClient {
    name: String,
    entry: ServerEntry,
    http: reqwest::Client,
    oauth: Arc<OAuthManager>,
    state: Mutex<Lifecycle>,
    idle: Mutex<Vec<Box<dyn McpSession>>>,
    tools: RwLock<Option<Vec<ToolDescriptor>>>,
}

impl ProxyClient {
    fn new(
        name: &str,
        entry: ServerEntry,
        http: reqwest::Client,
        oauth: Arc<OAuthManager>,
    ) -> Self {
        Self {
            name: name.to_string(),
            entry,
            http,
            oauth,
            state: Mutex::new(Lifecycle::Pending),
            idle: Mutex::new(Vec::new()),
            tools: RwLock::new(None),
        }
    }

    /// Downstream server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The catalog descriptor this handle was built from.
    pub fn entry(&self) -> &ServerEntry {
        &self.entry
    }

    /// Current lifecycle state.
    pub async fn lifecycle(&self) -> Lifecycle {
        *self.state.lock().await
    }

    async fn set_state(&self, state: Lifecycle) {
        *self.state.lock().await = state;
    }

    fn map_err(&self, err: SessionError, tool_call: bool) -> PorteroError {
        let server = self.name.clone();
        match err {
            SessionError::Transport(message) => PorteroError::Unreachable { server, message },
            SessionError::Protocol(message) => PorteroError::Protocol { server, message },
            SessionError::Auth(message) => PorteroError::Auth { server, message },
            SessionError::Rpc { code, message } => {
                let message = format!("rpc error {code}: {message}");
                if tool_call {
                    PorteroError::ToolError { server, message }
                } else {
                    PorteroError::Protocol { server, message }
                }
            }
        }
    }

    async fn lease(&self) -> PorteroResult<Box<dyn McpSession>> {
        if *self.state.lock().await == Lifecycle::Shutdown {
            return Err(PorteroError::Unreachable {
                server: self.name.clone(),
                message: "server has been shut down".into(),
            });
        }
        if let Some(session) = self.idle.lock().await.pop() {
            return Ok(session);
        }
        let connected: Result<Box<dyn McpSession>, SessionError> = match &self.entry {
            ServerEntry::Stdio(config) => StdioSession::connect(&self.name, config)
                .await
                .map(|s| Box::new(s) as Box<dyn McpSession>),
            ServerEntry::Http(config) => {
                HttpSession::connect(&self.name, config, self.http.clone(), self.oauth.clone())
                    .await
                    .map(|s| Box::new(s) as Box<dyn McpSession>)
            }
        };
        match connected {
            Ok(session) => {
                self.set_state(Lifecycle::Ready).await;
                Ok(session)
            }
            Err(e) => {
                self.set_state(Lifecycle::Failed).await;
                Err(self.map_err(e, false))
            }
        }
    }

    async fn release(&self, mut session: Box<dyn McpSession>) {
        if *self.state.lock().await == Lifecycle::Shutdown {
            session.close().await;
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE_SESSIONS {
            idle.push(session);
        } else {
            drop(idle);
            session.close().await;
        }
    }

    async fn discard(&self, mut session: Box<dyn McpSession>, err: &SessionError) {
        session.close().await;
        if matches!(err, SessionError::Transport(_)) {
            self.set_state(Lifecycle::Failed).await;
        }
    }

    /// Fetch (or return cached) tool schemas from the downstream.
    pub async fn list_tools(&self) -> PorteroResult<Vec<ToolDescriptor>> {
        if let Some(cached) = self.tools.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let mut session = self.lease().await?;
        match session.request("tools/list", None).await {
            Ok(result) => {
                self.release(session).await;
                let tools: Vec<ToolDescriptor> = serde_json::from_value(
                    result
                        .get("tools")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!([])),
                )
                .map_err(|e| PorteroError::Protocol {
                    server: self.name.clone(),
                    message: format!("bad tools/list result: {e}"),
                })?;
                *self.tools.write().await = Some(tools.clone());
                Ok(tools)
            }
            Err(e) => {
                self.discard(session, &e).await;
                Err(self.map_err(e, false))
            }
        }
    }

    /// Forward one `tools/call`, returning the downstream result
    /// verbatim. A JSON-RPC error (e.g. unknown tool) leaves the
    /// session healthy; transport failures close it.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> PorteroResult<Value> {
        let mut session = self.lease().await?;
        let params = serde_json::json!({"name": tool, "arguments": arguments});
        match session.request("tools/call", Some(params)).await {
            Ok(result) => {
                self.release(session).await;
                Ok(result)
            }
            Err(e @ SessionError::Rpc { .. }) => {
                self.release(session).await;
                Err(self.map_err(e, true))
            }
            Err(e) => {
                self.discard(session, &e).await;
                Err(self.map_err(e, true))
            }
        }
    }

    /// Drop the cached tool list; the next enumeration re-fetches.
    pub async fn invalidate_tools(&self) {
        *self.tools.write().await = None;
    }

    /// Close every pooled session and refuse further leases.
    pub async fn shutdown(&self) {
        self.set_state(Lifecycle::Shutdown).await;
        let sessions: Vec<Box<dyn McpSession>> = self.idle.lock().await.drain(..).collect();
        for mut session in sessions {
            session.close().await;
        }
    }
}

/// Owns the registry of downstream handles.
///
/// The registry lock guards only map access; connecting, calling, and
/// shutting down all happen outside it.
pub struct ProxyManager {
    clients: RwLock<HashMap<String, Arc<ProxyClient>>>,
    http: reqwest::Client,
    oauth: Arc<OAuthManager>,
}

impl ProxyManager {
    /// Create a manager caching OAuth tokens under `token_cache_dir`.
    pub fn new(token_cache_dir: PathBuf) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
            oauth: Arc::new(OAuthManager::new(token_cache_dir)),
        }
    }

    /// Return the handle for `name`, creating it (unconnected) on first
    /// use.
    pub async fn ensure(&self, name: &str, entry: &ServerEntry) -> Arc<ProxyClient> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(name) {
                return client.clone();
            }
        }
        let mut clients = self.clients.write().await;
        clients
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ProxyClient::new(
                    name,
                    entry.clone(),
                    self.http.clone(),
                    self.oauth.clone(),
                ))
            })
            .clone()
    }

    /// Fetch (or return cached) tool schemas for one server.
    pub async fn list_tools(
        &self,
        name: &str,
        entry: &ServerEntry,
    ) -> PorteroResult<Vec<ToolDescriptor>> {
        self.ensure(name, entry).await.list_tools().await
    }

    /// Forward a tool call to one server. The reserved `agent_id`
    /// argument is stripped here so no downstream ever observes it.
    pub async fn call_tool(
        &self,
        name: &str,
        entry: &ServerEntry,
        tool: &str,
        mut args: serde_json::Map<String, Value>,
    ) -> PorteroResult<Value> {
        sanitize_arguments(&mut args);
        self.ensure(name, entry)
            .await
            .call_tool(tool, Value::Object(args))
            .await
    }

    /// Enumerate tools across `servers`, names prefixed `<server>_`.
    /// Servers that fail to answer are skipped with a warning rather
    /// than failing the whole enumeration.
    pub async fn enumerate_prefixed(
        &self,
        catalog: &Catalog,
        servers: &[String],
    ) -> Vec<ToolDescriptor> {
        let mut out = Vec::new();
        for name in servers {
            let Some(entry) = catalog.get(name) else {
                continue;
            };
            match self.list_tools(name, entry).await {
                Ok(tools) => out.extend(tools.into_iter().map(|mut tool| {
                    tool.name = format!("{name}_{}", tool.name);
                    tool
                })),
                Err(e) => {
                    warn!(server = %name, error = %e, "skipping server during enumeration");
                }
            }
        }
        out
    }

    /// Split a `<server>_<tool>` prefixed name back into its parts,
    /// matching the longest catalog server name.
    pub fn split_prefixed(catalog: &Catalog, prefixed: &str) -> Option<(String, String)> {
        catalog
            .servers
            .keys()
            .filter(|name| {
                prefixed.len() > name.len() + 1
                    && prefixed.starts_with(name.as_str())
                    && prefixed.as_bytes()[name.len()] == b'_'
            })
            .max_by_key(|name| name.len())
            .map(|name| (name.clone(), prefixed[name.len() + 1..].to_string()))
    }

    /// Reconcile handles against a freshly loaded catalog: shut down
    /// removed or changed servers, register added ones, leave the rest
    /// untouched.
    pub async fn reconcile(&self, catalog: &Catalog) {
        let mut to_shutdown: Vec<Arc<ProxyClient>> = Vec::new();
        {
            let mut clients = self.clients.write().await;

            let removed: Vec<String> = clients
                .keys()
                .filter(|name| !catalog.servers.contains_key(*name))
                .cloned()
                .collect();
            for name in removed {
                if let Some(client) = clients.remove(&name) {
                    info!(server = %name, "downstream removed from catalog");
                    to_shutdown.push(client);
                }
            }

            for (name, entry) in &catalog.servers {
                let replace = match clients.get(name) {
                    None => true,
                    Some(existing) if existing.entry() != entry => {
                        info!(server = %name, "downstream descriptor changed");
                        to_shutdown.push(existing.clone());
                        true
                    }
                    Some(_) => false,
                };
                if replace {
                    clients.insert(
                        name.clone(),
                        Arc::new(ProxyClient::new(
                            name,
                            entry.clone(),
                            self.http.clone(),
                            self.oauth.clone(),
                        )),
                    );
                }
            }
        }
        for client in to_shutdown {
            client.shutdown().await;
        }
    }

    /// Shut down every handle.
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<ProxyClient>> = {
            let mut map = self.clients.write().await;
            map.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            client.shutdown().await;
        }
    }

    /// Lifecycle state of every registered handle.
    pub async fn states(&self) -> BTreeMap<String, Lifecycle> {
        let clients = self.clients.read().await;
        let mut out = BTreeMap::new();
        for (name, client) in clients.iter() {
            out.insert(name.clone(), client.lifecycle().await);
        }
        out
    }
}
