//! Shared harness for the HTTP-level tests: a mock MCP upstream, a seeded
//! gateway configuration and a one-shot request helper.

#![allow(dead_code)]

use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    http::{HeaderMap, Request, StatusCode},
    routing::post,
};
use mcp_policy_gateway::config::Config;
use mcp_policy_gateway::gateway::Gateway;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Every permission
pub const ADMIN_KEY: &str =
    "gwo_prd_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
/// `mcp:read,mcp:call,approvals:request`, user alice
pub const CALLER_KEY: &str =
    "gwo_prd_bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
/// `mcp:read` only
pub const READER_KEY: &str =
    "gwo_prd_cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";
/// `mcp:*` with a quota of two requests per window
pub const THROTTLED_KEY: &str =
    "gwo_dev_dddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddd";
/// Key of another organization
pub const OTHER_ORG_KEY: &str =
    "gwo_stg_eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee";

/// Session of user dana (developer role)
pub const DANA_SESSION: &str = "4d1c6b0e-7f55-4c3a-9a8e-2b7f0c9d1e21";

/// Tool the mock upstream answers slowly
pub const SLOW_TOOL: &str = "slow_query";

/// Mock MCP upstream. `tools/call` echoes the tool, arguments and trace id.
pub async fn spawn_upstream() -> String {
    let app = Router::new()
        .route("/tools/call", post(tools_call))
        .route(
            "/tools/list",
            post(|| async { Json(json!({"tools": [{"name": "read_file"}, {"name": "write_file"}]})) }),
        )
        .route(
            "/resources/read",
            post(|| async { (StatusCode::NOT_FOUND, Json(json!({"error": "no such resource"}))) }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("http://{addr}")
}

async fn tools_call(headers: HeaderMap, body: Bytes) -> Json<Value> {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let tool = body
        .get("tool")
        .or_else(|| body.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if tool == SLOW_TOOL {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    Json(json!({
        "tool": tool,
        "arguments": body.get("arguments").cloned().unwrap_or(Value::Null),
        "trace_id": headers.get("x-trace-id").and_then(|v| v.to_str().ok()),
    }))
}

/// Gateway configuration with seeded keys, a session, classifications and
/// two upstreams: `fs` (the mock) and `down` (nothing listening)
pub fn config(upstream: &str) -> Config {
    let yaml = format!(
        r#"
auth:
  api_keys:
    - key: {ADMIN_KEY}
      key_id: key_admin
      name: admin
      org_id: acme
      user_id: root
      permissions: "*"
    - key: {CALLER_KEY}
      key_id: key_alice
      name: alice
      org_id: acme
      user_id: alice
      team_id: platform
      permissions: "mcp:read,mcp:call,approvals:request"
    - key: {READER_KEY}
      key_id: key_reader
      name: reader
      org_id: acme
      permissions: "mcp:read"
    - key: {THROTTLED_KEY}
      key_id: key_throttled
      name: throttled
      org_id: acme
      permissions: "mcp:*"
      rate_limit: 2
    - key: {OTHER_ORG_KEY}
      key_id: key_globex
      name: globex
      org_id: globex
      user_id: gina
      permissions: "*"
  sessions:
    - id: {DANA_SESSION}
      user_id: dana
      org_id: acme
      team_id: platform
rbac:
  assignments:
    - user_id: dana
      org_id: acme
      role: developer
      scope: {{ type: org, id: acme }}
tools:
  classifications:
    - org_id: acme
      server: fs
      tool: {SLOW_TOOL}
      risk: safe
servers:
  fs:
    url: {upstream}
    timeout: 5s
    pricing:
      per_call: 0.002
  down:
    url: http://127.0.0.1:9
    timeout: 1s
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

/// Gateway wired to a fresh mock upstream
pub async fn gateway() -> Gateway {
    let upstream = spawn_upstream().await;
    Gateway::new(config(&upstream)).await.unwrap()
}

/// Response pieces the tests look at
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Reply {
    /// Header value as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `error.code` of an error body
    pub fn error_code(&self) -> Option<&str> {
        self.body["error"]["code"].as_str()
    }
}

/// Send one request through a fresh router instance
pub async fn send(
    gateway: &Gateway,
    method: &str,
    path: &str,
    key: Option<&str>,
    body: Option<Value>,
) -> Reply {
    send_via(gateway.router(), method, path, key, body).await
}

/// Send one request through `router`
pub async fn send_via(
    router: Router,
    method: &str,
    path: &str,
    key: Option<&str>,
    body: Option<Value>,
) -> Reply {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    Reply {
        status,
        headers,
        body,
    }
}

/// `POST /v1/mcp/fs/tools/call` for `tool`
pub async fn call_tool(gateway: &Gateway, key: &str, tool: &str, arguments: Value) -> Reply {
    send(
        gateway,
        "POST",
        "/v1/mcp/fs/tools/call",
        Some(key),
        Some(json!({"tool": tool, "arguments": arguments})),
    )
    .await
}
