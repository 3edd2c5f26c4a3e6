//! HTTP router and MCP handler

use std::any::Any;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::Request,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{debug, error};

use super::admin::admin_routes;
use super::pipeline::{
    BufferedBody, audit_middleware, client_ip, identity_middleware, permission_middleware,
    rate_limit_middleware, safety_middleware, tool_access_middleware,
};
use super::proxy::{ForwardContext, Operation, ProxyForwarder};
use super::trace::{TraceContext, trace_middleware};
use crate::audit::AuditRecorder;
use crate::batch::{BatchExecutor, BatchRequest};
use crate::config::Config;
use crate::identity::{IdentityResolver, KeyManager, Principal};
use crate::ratelimit::RateLimiter;
use crate::rbac::PermissionEngine;
use crate::safety::SafetyDetector;
use crate::tools::{Caller, ToolAccessController};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<Config>,
    /// Credential resolution
    pub resolver: Arc<IdentityResolver>,
    /// API key management
    pub keys: Arc<KeyManager>,
    /// Roles and permission checks
    pub rbac: Arc<PermissionEngine>,
    /// Per-principal quotas
    pub limiter: Arc<RateLimiter>,
    /// Prompt-injection detection
    pub safety: Arc<SafetyDetector>,
    /// Tool classification, grants and approvals
    pub tools: Arc<ToolAccessController>,
    /// Audit trail
    pub audit: Arc<AuditRecorder>,
    /// Upstream forwarding
    pub proxy: Arc<ProxyForwarder>,
    /// Batch fan-out
    pub batch: Arc<BatchExecutor>,
}

/// Create the router.
///
/// MCP routes run the full enforcement chain; management routes are rate
/// limited and check permissions per handler.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mcp = Router::new()
        .route("/v1/mcp/{server}/{kind}/{action}", post(mcp_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), tool_access_middleware))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), safety_middleware))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit_middleware))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), permission_middleware));

    let admin = admin_routes()
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/version", get(version_handler))
        .merge(mcp)
        .merge(admin)
        .layer(middleware::from_fn_with_state(Arc::clone(&state), identity_middleware))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), audit_middleware))
        .layer(middleware::from_fn(trace_middleware))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Log the panic payload and answer with the generic 500 body
fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");
    error!(panic = %detail, "Handler panicked");
    Error::Internal(detail.to_string()).into_response()
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ready",
        "servers": state.proxy.servers(),
    }))
}

async fn version_handler() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `POST /v1/mcp/{server}/{kind}/{action}`
async fn mcp_handler(
    State(state): State<Arc<AppState>>,
    Path((server, kind, action)): Path<(String, String, String)>,
    Extension(principal): Extension<Principal>,
    request: Request<Body>,
) -> Result<Response> {
    let ctx = ForwardContext {
        trace: request.extensions().get::<TraceContext>().cloned(),
        client_ip: client_ip(&request),
    };
    let buffered = request.extensions().get::<BufferedBody>().map(|b| b.0.clone());
    let body = match buffered {
        Some(bytes) => bytes,
        None => axum::body::to_bytes(request.into_body(), state.config.server.max_body_size)
            .await
            .map_err(|_| Error::Validation("Request body too large".to_string()))?,
    };

    if kind == "tools" && action == "batch" {
        let batch: BatchRequest = serde_json::from_slice(&body)?;
        let caller = Caller {
            org_id: &principal.org_id,
            subject: Some(principal.subject()),
            team_id: principal.team_id.as_deref(),
        };
        let response = state.batch.execute(caller, &server, batch, &ctx).await?;
        return Ok(Json(json!({ "data": response })).into_response());
    }

    let op = Operation::parse(&kind, &action)
        .ok_or_else(|| Error::NotFound(format!("Unknown MCP operation '{kind}/{action}'")))?;
    if !state.proxy.has_server(&server) {
        return Err(Error::ServerNotFound(server));
    }
    op.validate(&parse_payload(&body)?)?;

    debug!(server = %server, operation = %op, org = %principal.org_id, "Forwarding MCP call");
    let forwarded = state.proxy.forward(&server, op, body, &ctx, None).await?;
    Ok(forwarded.into_response())
}

/// Empty bodies are an empty object; anything else must be JSON
fn parse_payload(body: &Bytes) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn empty_payload_is_an_object() {
        assert_eq!(parse_payload(&Bytes::new()).unwrap(), json!({}));
        assert_eq!(
            parse_payload(&Bytes::from_static(br#"{"uri":"file:///a"}"#)).unwrap(),
            json!({"uri": "file:///a"})
        );
        assert!(parse_payload(&Bytes::from_static(b"not json")).is_err());
    }

    #[test]
    fn panic_handler_hides_payload() {
        let response = handle_panic(Box::new("index out of bounds".to_string()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
