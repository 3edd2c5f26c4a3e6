//! Policy-enforcement middlewares.
//!
//! Applied per request, outermost first:
//!
//! 1. [`audit_middleware`] wraps everything below and records the outcome
//! 2. [`identity_middleware`] resolves the credential into a [`Principal`]
//! 3. [`permission_middleware`] checks `mcp:call` / `mcp:read` (MCP routes)
//! 4. [`rate_limit_middleware`] counts the request against the principal quota
//! 5. [`safety_middleware`] scans the payload for prompt injection (MCP routes)
//! 6. [`tool_access_middleware`] gates `tools/call` on the tool's risk class
//!
//! Any stage may short-circuit with an [`Error`] response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use gateway_core::permission;
use serde_json::Value;
use tracing::{debug, warn};

use super::proxy::{Operation, tool_name};
use super::router::AppState;
use super::trace::TraceContext;
use crate::audit::{AuditLog, AuditOutcome, derive_action, extract_details};
use crate::identity::Principal;
use crate::safety::{DetectContext, SafetyMode, WARNING_HEADER, WARNING_MESSAGE};
use crate::tools::Caller;
use crate::{Error, Result};

/// Quota header
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Remaining requests header
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Seconds-until-reset header
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Request body already read by an earlier stage
#[derive(Debug, Clone)]
pub struct BufferedBody(pub Bytes);

/// Read the request body once and make it available to later stages.
///
/// The returned request carries the same bytes as its body and in a
/// [`BufferedBody`] extension.
pub async fn buffered(request: Request<Body>, limit: usize) -> Result<(Request<Body>, Bytes)> {
    if let Some(BufferedBody(bytes)) = request.extensions().get::<BufferedBody>() {
        let bytes = bytes.clone();
        return Ok((request, bytes));
    }
    let (mut parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| Error::Validation(format!("Request body exceeds {limit} bytes")))?;
    parts.extensions.insert(BufferedBody(bytes.clone()));
    Ok((Request::from_parts(parts, Body::from(bytes.clone())), bytes))
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer
pub fn client_ip<B>(request: &Request<B>) -> Option<String> {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
    };
    header("x-forwarded-for").or_else(|| header("x-real-ip")).or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    })
}

/// What an MCP request path addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpCall {
    /// A single forwarded operation
    Op(Operation),
    /// `tools/batch` fan-out
    Batch,
}

/// Server and call parsed from `/v1/mcp/{server}/{kind}/{action}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpTarget {
    /// Upstream server name
    pub server: String,
    /// Addressed call
    pub call: McpCall,
}

impl McpTarget {
    /// Parse an MCP route path; `None` for anything else
    #[must_use]
    pub fn parse(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let ["v1", "mcp", server, kind, action] = segments.as_slice() else {
            return None;
        };
        let call = match (*kind, *action) {
            ("tools", "batch") => McpCall::Batch,
            (kind, action) => McpCall::Op(Operation::parse(kind, action)?),
        };
        Some(Self {
            server: (*server).to_string(),
            call,
        })
    }

    /// Permission the principal must hold
    #[must_use]
    pub fn required_permission(&self) -> &'static str {
        match self.call {
            McpCall::Op(Operation::ToolsCall) | McpCall::Batch => permission::MCP_CALL,
            McpCall::Op(_) => permission::MCP_READ,
        }
    }
}

fn principal_of<B>(request: &Request<B>) -> Result<Principal> {
    request
        .extensions()
        .get::<Principal>()
        .cloned()
        .ok_or_else(|| Error::Unauthorized("Authentication required".to_string()))
}

// ── Identity ──

/// Resolve the caller's credential. Public paths pass through unauthenticated.
pub async fn identity_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if state.config.auth.is_public_path(path) {
        debug!(path = %path, "Public path, skipping identity");
        return next.run(request).await;
    }

    let principal = match state.resolver.resolve(request.headers()).await {
        Ok(p) => p,
        Err(e) => {
            warn!(path = %path, error = %e, "Authentication failed");
            return e.into_response();
        }
    };
    debug!(org = %principal.org_id, subject = %principal.subject(), "Authenticated request");
    request.extensions_mut().insert(principal.clone());

    let mut response = next.run(request).await;
    // Audit reads the principal off the response
    response.extensions_mut().insert(principal);
    response
}

// ── Permission ──

/// Require `mcp:call` for tool calls and batches, `mcp:read` otherwise
pub async fn permission_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(target) = McpTarget::parse(request.uri().path()) else {
        return next.run(request).await;
    };
    let principal = match principal_of(&request) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    match state.rbac.require(&principal, target.required_permission()).await {
        Ok(()) => next.run(request).await,
        Err(e) => {
            warn!(
                subject = %principal.subject(),
                server = %target.server,
                permission = target.required_permission(),
                "MCP call not permitted"
            );
            e.into_response()
        }
    }
}

// ── Rate limit ──

fn set_rate_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset: u64) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(reset));
}

/// Count the request against the principal's per-minute quota.
///
/// Limit headers are set on every response, admitted or not.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.limiter.is_enabled() {
        return next.run(request).await;
    }
    let Some(principal) = request.extensions().get::<Principal>() else {
        return next.run(request).await;
    };
    let key = principal.rate_limit_key();
    let decision = state.limiter.allow(&key, principal.rate_limit).await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        warn!(key = %key, limit = decision.limit, "Rate limit exceeded");
        Error::RateLimited {
            retry_after: decision.reset_secs,
        }
        .into_response()
    };
    set_rate_headers(
        response.headers_mut(),
        decision.limit,
        decision.remaining,
        decision.reset_secs,
    );
    response
}

// ── Safety ──

/// Scan the payload's string leaves against the organization's policies
pub async fn safety_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.safety.enabled {
        return next.run(request).await;
    }
    let Some(target) = McpTarget::parse(request.uri().path()) else {
        return next.run(request).await;
    };
    let principal = match principal_of(&request) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let (request, body) = match buffered(request, state.config.server.max_body_size).await {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };

    let payload = serde_json::from_slice::<Value>(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
    let trace = request.extensions().get::<TraceContext>();
    let ctx = DetectContext {
        org_id: principal.org_id.clone(),
        server: Some(target.server.clone()),
        tool: tool_name(&payload).map(ToString::to_string),
        trace_id: trace.map(|t| t.trace_id.clone()),
        span_id: trace.map(|t| t.span_id.clone()),
        key_id: principal.key_id.clone(),
        ip_address: client_ip(&request),
    };

    let result = match state.safety.detect_value(&ctx, &payload).await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    if !result.detected {
        return next.run(request).await;
    }

    let severity = result.severity.map_or("medium", |s| s.as_str()).to_string();
    let kind = result.kind.map_or("prompt_injection", |k| k.as_str()).to_string();
    match result.action {
        SafetyMode::Block => {
            warn!(
                org = %ctx.org_id,
                server = %target.server,
                severity = %severity,
                policy = ?result.policy_id,
                "Blocked request: prompt injection detected"
            );
            Error::SafetyBlocked { severity, kind }.into_response()
        }
        SafetyMode::Warn => {
            warn!(org = %ctx.org_id, server = %target.server, severity = %severity, "Prompt injection warning");
            let mut response = next.run(request).await;
            response
                .headers_mut()
                .insert(WARNING_HEADER, HeaderValue::from_static(WARNING_MESSAGE));
            response
        }
        SafetyMode::Log => {
            debug!(org = %ctx.org_id, server = %target.server, severity = %severity, "Prompt injection logged");
            next.run(request).await
        }
    }
}

// ── Tool access ──

/// Gate `tools/call` on the tool's risk classification, grants and approvals
pub async fn tool_access_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(target) = McpTarget::parse(request.uri().path()) else {
        return next.run(request).await;
    };
    if target.call != McpCall::Op(Operation::ToolsCall) {
        return next.run(request).await;
    }
    let principal = match principal_of(&request) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let (request, body) = match buffered(request, state.config.server.max_body_size).await {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    // A missing tool name is rejected by the handler
    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return next.run(request).await;
    };
    let Some(tool) = tool_name(&payload) else {
        return next.run(request).await;
    };

    let caller = Caller {
        org_id: &principal.org_id,
        subject: Some(principal.subject()),
        team_id: principal.team_id.as_deref(),
    };
    match state.tools.admit(caller, &target.server, tool).await {
        Ok(decision) if decision.allowed => next.run(request).await,
        Ok(decision) => {
            warn!(
                subject = %principal.subject(),
                server = %target.server,
                tool = %tool,
                risk = decision.risk.as_str(),
                "Tool call denied"
            );
            Error::ToolAccessDenied(decision.reason).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── Audit ──

/// Record an audit event for every auditable route once the response is ready.
///
/// The record is queued, never awaited.
pub async fn audit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.audit.is_enabled() {
        return next.run(request).await;
    }
    let Some(route) = derive_action(request.method().as_str(), request.uri().path()) else {
        return next.run(request).await;
    };
    let started = Instant::now();

    let header = |request: &Request<Body>, name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };
    let trace_id = request.extensions().get::<TraceContext>().map(|t| t.trace_id.clone());
    let ip_address = client_ip(&request);
    let user_agent = header(&request, "user-agent");
    let request_id = header(&request, "x-request-id");

    let mut details = serde_json::Map::new();
    let response = if matches!(*request.method(), Method::POST | Method::PUT) {
        match buffered(request, state.config.server.max_body_size).await {
            Ok((request, body)) => {
                details = extract_details(route.action, &body);
                next.run(request).await
            }
            Err(e) => e.into_response(),
        }
    } else {
        next.run(request).await
    };

    let status = response.status().as_u16();
    let principal = response.extensions().get::<Principal>();
    let entry = AuditLog {
        id: uuid::Uuid::new_v4().to_string(),
        org_id: principal.map(|p| p.org_id.clone()),
        team_id: principal.and_then(|p| p.team_id.clone()),
        user_id: principal.and_then(|p| p.user_id.clone()),
        key_id: principal.and_then(|p| p.key_id.clone()),
        trace_id,
        action: route.action,
        resource: route.resource,
        resource_id: route.resource_id,
        outcome: AuditOutcome::from_status(status),
        status,
        details,
        ip_address,
        user_agent,
        request_id,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        created_at: Utc::now(),
    };
    state.audit.record(entry);
    response
}
