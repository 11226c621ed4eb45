//! MCP (Model Context Protocol) JSON-RPC 2.0 message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision spoken on both sides of the gateway.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 parse error.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC 2.0 invalid request.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC 2.0 method not found.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC 2.0 invalid params.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC 2.0 internal error.
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC 2.0 request, as sent to downstream servers.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response from a downstream server.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// An incoming message on the gateway's own (upstream) MCP connection.
///
/// Caller ids are echoed back verbatim, so they stay opaque JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Build a JSON-RPC success response for an upstream caller.
pub fn response_ok(id: &Value, result: Value) -> Value {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})
}

/// Build a JSON-RPC error response for an upstream caller.
pub fn response_err(id: Option<&Value>, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id.cloned().unwrap_or(Value::Null),
        "error": {"code": code, "message": message},
    })
}

/// MCP tool definition from a `tools/list` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// MCP server capabilities from the `initialize` response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
}

/// MCP initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Parameters for the MCP `initialize` handshake the gateway performs
/// as a downstream client.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "portero",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Whether a `tools/call` result reports a tool-level failure.
pub fn tool_result_is_error(result: &Value) -> bool {
    result.get("isError").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::new(1, "tools/call", Some(serde_json::json!({"name": "x"})));
        let json = serde_json::to_string(&req).unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["params"]["name"], "x");
    }

    #[test]
    fn test_request_no_params_key_omitted() {
        let req = JsonRpcRequest::new(2, "tools/list", None);
        let parsed: Value =
            serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert!(parsed.get("params").is_none());
    }

    #[test]
    fn test_response_parse() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert_eq!(resp.id, Some(1));
        assert!(resp.result.is_some());
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_error_parse() {
        let resp: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(err.message, "no such method");
    }

    #[test]
    fn test_incoming_message_string_id_preserved() {
        let msg: IncomingMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc-1","method":"tools/list"}"#)
                .unwrap();
        assert_eq!(msg.id, Some(Value::String("abc-1".into())));
        let out = response_ok(msg.id.as_ref().unwrap(), serde_json::json!({}));
        assert_eq!(out["id"], "abc-1");
    }

    #[test]
    fn test_tool_descriptor_parse_defaults_schema() {
        let tool: ToolDescriptor = serde_json::from_str(r#"{"name":"web_search"}"#).unwrap();
        assert_eq!(tool.name, "web_search");
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn test_tool_result_error_flag() {
        assert!(tool_result_is_error(&serde_json::json!({"isError": true, "content": []})));
        assert!(!tool_result_is_error(&serde_json::json!({"content": []})));
    }

    #[test]
    fn test_response_err_null_id() {
        let out = response_err(None, PARSE_ERROR, "bad json");
        assert!(out["id"].is_null());
        assert_eq!(out["error"]["code"], -32700);
    }
}
