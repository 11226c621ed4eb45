//! Integration tests for the HTTP transport and OAuth activation,
//! against a mock MCP server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{Duration as ChronoDuration, Utc};
use portero_config::Catalog;
use portero_mcp::oauth::{OAuthManager, TokenSet};
use portero_mcp::protocol::tool_result_is_error;
use portero_mcp::ProxyManager;
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Answers MCP JSON-RPC over HTTP, echoing request ids. When
/// `require_bearer` is set, anything without that token gets a 401
/// Bearer challenge.
struct McpResponder {
    require_bearer: Option<String>,
}

impl Respond for McpResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if let Some(expected) = &self.require_bearer {
            let authorized = request
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == format!("Bearer {expected}"));
            if !authorized {
                return ResponseTemplate::new(401)
                    .insert_header("WWW-Authenticate", "Bearer realm=\"mcp\"");
            }
        }

        let body: Value = serde_json::from_slice(&request.body).unwrap_or_else(|_| json!({}));
        let Some(id) = body.get("id").cloned() else {
            // Notifications get 202 and no body.
            return ResponseTemplate::new(202);
        };
        let result = match body["method"].as_str().unwrap_or_default() {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock-downstream", "version": "0.1.0"},
            }),
            "tools/list" => json!({"tools": [
                {"name": "web_search", "description": "Search the web",
                 "inputSchema": {"type": "object", "properties": {"query": {"type": "string"}}}},
                {"name": "boom", "description": "Always fails",
                 "inputSchema": {"type": "object"}},
            ]}),
            "tools/call" => match body["params"]["name"].as_str().unwrap_or_default() {
                "boom" => json!({
                    "content": [{"type": "text", "text": "exploded"}],
                    "isError": true,
                }),
                "web_search" => json!({
                    "content": [{"type": "text", "text": "results"}],
                    "isError": false,
                }),
                other => {
                    return ResponseTemplate::new(200).set_body_json(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32602, "message": format!("Unknown tool: {other}")},
                    }));
                }
            },
            _ => {
                return ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "method not found"},
                }));
            }
        };
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }))
    }
}

async fn mock_downstream(require_bearer: Option<String>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(McpResponder { require_bearer })
        .mount(&server)
        .await;
    server
}

fn catalog_for(server: &MockServer) -> Catalog {
    serde_json::from_value(json!({"mcpServers": {
        "api": {"url": format!("{}/mcp", server.uri())},
    }}))
    .unwrap()
}

fn args(json: Value) -> serde_json::Map<String, Value> {
    json.as_object().unwrap().clone()
}

#[tokio::test]
async fn test_call_tool_over_http() {
    let server = mock_downstream(None).await;
    let catalog = catalog_for(&server);
    let tokens = TempDir::new().unwrap();
    let manager = ProxyManager::new(tokens.path().to_path_buf());

    let result = manager
        .call_tool(
            "api",
            catalog.get("api").unwrap(),
            "web_search",
            args(json!({"query": "rust"})),
        )
        .await
        .unwrap();
    assert!(!tool_result_is_error(&result));
    assert_eq!(result["content"][0]["text"], "results");
}

#[tokio::test]
async fn test_agent_id_never_reaches_downstream() {
    let server = mock_downstream(None).await;
    let catalog = catalog_for(&server);
    let tokens = TempDir::new().unwrap();
    let manager = ProxyManager::new(tokens.path().to_path_buf());

    manager
        .call_tool(
            "api",
            catalog.get("api").unwrap(),
            "web_search",
            args(json!({"agent_id": "researcher", "query": "rust"})),
        )
        .await
        .unwrap();

    for request in server.received_requests().await.unwrap() {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or_else(|_| json!({}));
        if body["method"] == "tools/call" {
            assert!(
                body["params"]["arguments"].get("agent_id").is_none(),
                "agent_id leaked downstream: {body}"
            );
            assert_eq!(body["params"]["arguments"]["query"], "rust");
        }
    }
}

#[tokio::test]
async fn test_downstream_tool_failure_returned_verbatim() {
    let server = mock_downstream(None).await;
    let catalog = catalog_for(&server);
    let tokens = TempDir::new().unwrap();
    let manager = ProxyManager::new(tokens.path().to_path_buf());

    // The tool ran and reported failure: that is a successful forward,
    // with the error carried inside the result.
    let result = manager
        .call_tool("api", catalog.get("api").unwrap(), "boom", args(json!({})))
        .await
        .unwrap();
    assert!(tool_result_is_error(&result));
    assert_eq!(result["content"][0]["text"], "exploded");
}

#[tokio::test]
async fn test_unknown_tool_is_downstream_tool_error() {
    let server = mock_downstream(None).await;
    let catalog = catalog_for(&server);
    let tokens = TempDir::new().unwrap();
    let manager = ProxyManager::new(tokens.path().to_path_buf());

    let err = manager
        .call_tool("api", catalog.get("api").unwrap(), "no_such_tool", args(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "downstream_tool_error");
    assert!(err.to_string().contains("api"));
}

#[tokio::test]
async fn test_tools_list_cached_until_invalidated() {
    let server = mock_downstream(None).await;
    let catalog = catalog_for(&server);
    let tokens = TempDir::new().unwrap();
    let manager = ProxyManager::new(tokens.path().to_path_buf());
    let entry = catalog.get("api").unwrap();

    let first = manager.list_tools("api", entry).await.unwrap();
    let second = manager.list_tools("api", entry).await.unwrap();
    assert_eq!(first, second);

    let list_calls = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| {
            serde_json::from_slice::<Value>(&r.body)
                .map(|b| b["method"] == "tools/list")
                .unwrap_or(false)
        })
        .count();
    assert_eq!(list_calls, 1, "second enumeration must hit the cache");
}

#[tokio::test]
async fn test_401_without_cached_token_is_auth_error() {
    let server = mock_downstream(Some("never-issued".into())).await;
    let catalog = catalog_for(&server);
    let tokens = TempDir::new().unwrap();
    let manager = ProxyManager::new(tokens.path().to_path_buf());

    let err = manager
        .call_tool("api", catalog.get("api").unwrap(), "web_search", args(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "downstream_auth");
    assert!(
        err.to_string().contains("authorization required"),
        "unexpected: {err}"
    );
}

async fn mount_oauth_endpoints(server: &MockServer, access_token: &str) {
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": access_token,
            "refresh_token": "rotated-refresh",
            "expires_in": 3600,
            "token_type": "Bearer",
        })))
        .expect(1)
        .mount(server)
        .await;
}

fn expired_tokens() -> TokenSet {
    TokenSet {
        access_token: "stale".into(),
        refresh_token: Some("refresh-1".into()),
        expires_at: Some(Utc::now() - ChronoDuration::hours(1)),
        token_type: "Bearer".into(),
        client_id: Some("portero".into()),
    }
}

#[tokio::test]
async fn test_401_with_cached_refresh_token_refreshes_and_retries() {
    let server = mock_downstream(Some("fresh-token".into())).await;
    mount_oauth_endpoints(&server, "fresh-token").await;

    let catalog = catalog_for(&server);
    let url = format!("{}/mcp", server.uri());
    let tokens = TempDir::new().unwrap();

    // Seed the cache with an expired access token and a refresh token.
    let seeder = OAuthManager::new(tokens.path().to_path_buf());
    seeder.save(&url, &expired_tokens()).await.unwrap();

    let manager = ProxyManager::new(tokens.path().to_path_buf());
    let result = manager
        .call_tool(
            "api",
            catalog.get("api").unwrap(),
            "web_search",
            args(json!({"query": "rust"})),
        )
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "results");

    let cached = seeder.load(&url).await.unwrap();
    assert_eq!(cached.access_token, "fresh-token");
    assert_eq!(cached.refresh_token.as_deref(), Some("rotated-refresh"));
}

#[tokio::test]
async fn test_concurrent_refreshes_coalesce() {
    let server = MockServer::start().await;
    // expect(1): a second token-endpoint hit fails the test on drop.
    mount_oauth_endpoints(&server, "fresh-token").await;

    let url = format!("{}/mcp", server.uri());
    let tokens = TempDir::new().unwrap();
    let manager = std::sync::Arc::new(OAuthManager::new(tokens.path().to_path_buf()));
    manager.save(&url, &expired_tokens()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move { manager.bearer_token(&url).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "fresh-token");
    }
}
