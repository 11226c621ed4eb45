//! The stdio MCP server loop.
//!
//! Newline-delimited JSON-RPC 2.0 on stdin/stdout. Tool calls run as
//! concurrent tasks against the snapshot captured at dispatch start; a
//! single writer task serializes output so each response is one whole
//! line. Signals: `SIGHUP` reloads, `SIGINT`/`SIGTERM` drain and exit.

use crate::middleware::{self, decision_for, resolve_agent};
use crate::state::GatewayState;
use crate::tools;
use portero_core::PorteroResult;
use portero_mcp::protocol::{
    response_err, response_ok, tool_result_is_error, IncomingMessage, METHOD_NOT_FOUND,
    PARSE_ERROR, PROTOCOL_VERSION,
};
use portero_security::audit::{Decision, Operation};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{error, info, warn};

type Cancellations = Arc<parking_lot::Mutex<HashMap<String, AbortHandle>>>;

/// An MCP tool result carrying an error kind and message.
fn error_result(kind: &str, message: &str) -> Value {
    json!({
        "content": [{"type": "text", "text": format!("{kind}: {message}")}],
        "isError": true,
    })
}

/// An MCP tool result wrapping gateway-produced data.
fn data_result(data: Value) -> Value {
    let text = serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string());
    json!({
        "content": [{"type": "text", "text": text}],
        "structuredContent": data,
        "isError": false,
    })
}

/// Run the middleware pipeline for one `tools/call` and produce the MCP
/// result: identity resolution, policy check, dispatch, audit.
pub async fn dispatch_tool(
    state: &GatewayState,
    name: &str,
    args: serde_json::Map<String, Value>,
) -> Value {
    let snapshot = state.current();
    let started = Instant::now();

    let operation = match name {
        "list_servers" => Operation::ListServers,
        "get_server_tools" => Operation::GetServerTools,
        "execute_tool" => Operation::ExecuteTool,
        "get_gateway_status" if state.debug => Operation::GetGatewayStatus,
        _ => return error_result("unknown_tool", &format!("no such tool: {name}")),
    };

    let agent = match resolve_agent(&args, state.default_agent.as_deref(), &snapshot.policy) {
        Ok(agent) => agent,
        Err(e) => {
            middleware::emit(
                state,
                None,
                operation,
                None,
                None,
                Decision::Deny,
                started.elapsed().as_millis() as u64,
                Some(format!("{}: {e}", e.kind())),
                None,
            )
            .await;
            return error_result(e.kind(), &e.to_string());
        }
    };
    let agent_name = agent.as_deref().unwrap_or("");

    match operation {
        Operation::ListServers => {
            let include_metadata = args
                .get("include_metadata")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let data = tools::list_servers(&snapshot, agent_name, include_metadata);
            let count = data["servers"].as_array().map_or(0, Vec::len);
            middleware::emit(
                state,
                agent.as_deref(),
                operation,
                None,
                None,
                Decision::Allow,
                started.elapsed().as_millis() as u64,
                None,
                Some(json!({"count": count})),
            )
            .await;
            data_result(data)
        }
        Operation::GetServerTools => {
            let Some(server) = args.get("server").and_then(Value::as_str) else {
                return error_result("invalid_params", "missing required argument \"server\"");
            };
            let filter = args.get("filter").and_then(Value::as_str);
            match tools::get_server_tools(state, &snapshot, agent_name, server, filter).await {
                Ok(data) => {
                    let count = data["tools"].as_array().map_or(0, Vec::len);
                    middleware::emit(
                        state,
                        agent.as_deref(),
                        operation,
                        Some(server),
                        None,
                        Decision::Allow,
                        started.elapsed().as_millis() as u64,
                        None,
                        Some(json!({"count": count})),
                    )
                    .await;
                    data_result(data)
                }
                Err(e) => {
                    middleware::emit(
                        state,
                        agent.as_deref(),
                        operation,
                        Some(server),
                        None,
                        decision_for(&e),
                        started.elapsed().as_millis() as u64,
                        Some(format!("{}: {e}", e.kind())),
                        None,
                    )
                    .await;
                    error_result(e.kind(), &e.to_string())
                }
            }
        }
        Operation::ExecuteTool => {
            let Some(server) = args.get("server").and_then(Value::as_str).map(str::to_string)
            else {
                return error_result("invalid_params", "missing required argument \"server\"");
            };
            let Some(tool) = args.get("tool").and_then(Value::as_str).map(str::to_string)
            else {
                return error_result("invalid_params", "missing required argument \"tool\"");
            };
            let tool_args = args
                .get("args")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            match tools::execute_tool(state, &snapshot, agent_name, &server, &tool, tool_args)
                .await
            {
                Ok(result) => {
                    let (decision, err) = if tool_result_is_error(&result) {
                        (Decision::Error, Some("downstream_tool_error".to_string()))
                    } else {
                        (Decision::Allow, None)
                    };
                    middleware::emit(
                        state,
                        agent.as_deref(),
                        operation,
                        Some(&server),
                        Some(&tool),
                        decision,
                        started.elapsed().as_millis() as u64,
                        err,
                        None,
                    )
                    .await;
                    // Downstream result flows through verbatim.
                    result
                }
                Err(e) => {
                    middleware::emit(
                        state,
                        agent.as_deref(),
                        operation,
                        Some(&server),
                        Some(&tool),
                        decision_for(&e),
                        started.elapsed().as_millis() as u64,
                        Some(format!("{}: {e}", e.kind())),
                        None,
                    )
                    .await;
                    error_result(e.kind(), &e.to_string())
                }
            }
        }
        Operation::GetGatewayStatus => {
            let data = tools::gateway_status(state, &snapshot).await;
            middleware::emit(
                state,
                agent.as_deref(),
                operation,
                None,
                None,
                Decision::Allow,
                started.elapsed().as_millis() as u64,
                None,
                None,
            )
            .await;
            data_result(data)
        }
    }
}

fn handle_line(
    state: &Arc<GatewayState>,
    out_tx: &mpsc::UnboundedSender<String>,
    inflight: &mut JoinSet<()>,
    cancellations: &Cancellations,
    line: &str,
) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let msg: IncomingMessage = match serde_json::from_str(trimmed) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = out_tx.send(
                response_err(None, PARSE_ERROR, &format!("invalid JSON-RPC: {e}")).to_string(),
            );
            return;
        }
    };

    match (msg.method.as_str(), msg.id) {
        ("initialize", Some(id)) => {
            let _ = out_tx.send(
                response_ok(
                    &id,
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {
                            "name": "portero",
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                )
                .to_string(),
            );
        }
        ("ping", Some(id)) => {
            let _ = out_tx.send(response_ok(&id, json!({})).to_string());
        }
        ("tools/list", Some(id)) => {
            let _ = out_tx.send(
                response_ok(&id, json!({"tools": tools::tool_definitions(state.debug)}))
                    .to_string(),
            );
        }
        ("tools/call", Some(id)) => {
            let params = msg.params.unwrap_or_else(|| json!({}));
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = params
                .get("arguments")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let key = id.to_string();
            let state = state.clone();
            let tx = out_tx.clone();
            let cancellations_for_task = cancellations.clone();
            let key_for_task = key.clone();
            let handle = inflight.spawn(async move {
                let result = dispatch_tool(&state, &name, args).await;
                cancellations_for_task.lock().remove(&key_for_task);
                let _ = tx.send(response_ok(&id, result).to_string());
            });
            cancellations.lock().insert(key, handle);
        }
        ("notifications/initialized", _) => {}
        ("notifications/cancelled", _) => {
            let request_id = msg
                .params
                .as_ref()
                .and_then(|p| p.get("requestId"))
                .map(ToString::to_string);
            if let Some(key) = request_id {
                if let Some(handle) = cancellations.lock().remove(&key) {
                    info!(request_id = %key, "cancelling in-flight request");
                    // Aborting drops the leased downstream session,
                    // which closes it.
                    handle.abort();
                }
            }
        }
        (method, Some(id)) => {
            let _ = out_tx.send(
                response_err(
                    Some(&id),
                    METHOD_NOT_FOUND,
                    &format!("method not supported: {method}"),
                )
                .to_string(),
            );
        }
        (_, None) => {}
    }
}

/// Serve MCP over stdio until stdin closes or a shutdown signal
/// arrives. `reload_rx` delivers debounced file-watcher events; SIGHUP
/// triggers the same reload path.
pub async fn run(
    state: Arc<GatewayState>,
    mut reload_rx: mpsc::UnboundedReceiver<()>,
) -> PorteroResult<()> {
    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::BufReader::new(stdin).lines();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut inflight = JoinSet::new();
    let cancellations: Cancellations = Arc::default();

    info!(debug = state.debug, "gateway listening on stdio");
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    handle_line(&state, &out_tx, &mut inflight, &cancellations, &line);
                }
                Ok(None) => {
                    info!("stdin closed; shutting down");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "stdin read failed; shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received; shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received; reloading configuration");
                let state = state.clone();
                tokio::spawn(async move {
                    let _ = crate::reload::reload(&state).await;
                });
            }
            Some(()) = reload_rx.recv() => {
                let state = state.clone();
                tokio::spawn(async move {
                    let _ = crate::reload::reload(&state).await;
                });
            }
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
        }
    }

    info!(inflight = inflight.len(), "draining in-flight requests");
    let drain = async {
        while inflight.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("drain timed out; aborting remaining requests");
    }
    state.proxies.shutdown().await;
    info!("gateway stopped");
    Ok(())
}
