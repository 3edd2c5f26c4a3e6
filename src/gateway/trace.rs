//! Trace and span ids with task-local propagation.
//!
//! Every request gets a [`TraceContext`] at ingress:
//!
//! - The trace id (`tr_<12 hex millis><16 hex random>`) is taken from an
//!   incoming `X-Trace-ID` header when present, otherwise minted.
//! - The span id (`sp_<16 hex>`) is always fresh; an incoming `X-Span-ID`
//!   becomes the parent span.
//! - Both ids are echoed on the response and forwarded upstream.
//!
//! The context is stored in the request extensions and installed in the
//! [`TRACE`] task-local for the lifetime of the request, so [`current`] works
//! anywhere in the call stack.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::Instrument;

/// Trace id header
pub const TRACE_HEADER: &str = "x-trace-id";
/// Span id header
pub const SPAN_HEADER: &str = "x-span-id";

const MAX_INBOUND_ID_LEN: usize = 128;

tokio::task_local! {
    /// Trace context of the request being handled
    pub static TRACE: TraceContext;
}

/// Correlation ids of one hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// Trace id shared by every hop
    pub trace_id: String,
    /// Span id of this hop
    pub span_id: String,
    /// Span id of the calling hop
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Fresh trace with a root span
    #[must_use]
    pub fn new_root() -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            parent_span_id: None,
        }
    }

    /// Continue the caller's trace if it sent one, otherwise start a new one
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let inbound = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty() && v.len() <= MAX_INBOUND_ID_LEN)
                .map(ToString::to_string)
        };
        match inbound(TRACE_HEADER) {
            Some(trace_id) => Self {
                trace_id,
                span_id: generate_span_id(),
                parent_span_id: inbound(SPAN_HEADER),
            },
            None => Self::new_root(),
        }
    }
}

/// `tr_` + 12 hex digits of the millisecond clock + 16 random hex digits
#[must_use]
pub fn generate_trace_id() -> String {
    let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0) & 0xffff_ffff_ffff;
    format!("tr_{millis:012x}{}", hex::encode(rand::random::<[u8; 8]>()))
}

/// `sp_` + 16 random hex digits
#[must_use]
pub fn generate_span_id() -> String {
    format!("sp_{}", hex::encode(rand::random::<[u8; 8]>()))
}

/// Trace context of the current task, if any
#[must_use]
pub fn current() -> Option<TraceContext> {
    TRACE.try_with(Clone::clone).ok()
}

/// Run `future` with `ctx` installed as the task-local trace context
pub async fn with_trace<F, T>(ctx: TraceContext, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    TRACE.scope(ctx, future).await
}

/// Middleware establishing the trace context and echoing its ids
pub async fn trace_middleware(mut request: Request<Body>, next: Next) -> Response {
    let ctx = TraceContext::from_headers(request.headers());
    request.extensions_mut().insert(ctx.clone());

    let span = tracing::info_span!("request", trace_id = %ctx.trace_id, span_id = %ctx.span_id);
    let mut response = with_trace(ctx.clone(), next.run(request).instrument(span)).await;

    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&ctx.trace_id) {
        headers.insert(TRACE_HEADER, v);
    }
    if let Ok(v) = HeaderValue::from_str(&ctx.span_id) {
        headers.insert(SPAN_HEADER, v);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── generate ──

    #[test]
    fn trace_id_has_time_and_random_parts() {
        let id = generate_trace_id();
        let body = id.strip_prefix("tr_").unwrap();
        assert_eq!(body.len(), 28);
        assert!(body.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn trace_ids_sort_by_creation_time() {
        let a = generate_trace_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate_trace_id();
        assert!(a[..15] <= b[..15]);
        assert_ne!(a, b);
    }

    #[test]
    fn span_id_format() {
        let id = generate_span_id();
        assert!(id.starts_with("sp_"));
        assert_eq!(id.len(), 19);
    }

    // ── from_headers ──

    #[test]
    fn inbound_trace_is_honored_and_span_is_fresh() {
        // GIVEN: a caller that sent its trace and span
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_HEADER, HeaderValue::from_static("tr_caller"));
        headers.insert(SPAN_HEADER, HeaderValue::from_static("sp_caller"));

        // WHEN: the context is built
        let ctx = TraceContext::from_headers(&headers);

        // THEN: trace continues, caller span becomes the parent
        assert_eq!(ctx.trace_id, "tr_caller");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("sp_caller"));
        assert_ne!(ctx.span_id, "sp_caller");
    }

    #[test]
    fn missing_trace_starts_a_root() {
        let ctx = TraceContext::from_headers(&HeaderMap::new());
        assert!(ctx.trace_id.starts_with("tr_"));
        assert!(ctx.parent_span_id.is_none());
    }

    // ── task-local ──

    #[tokio::test]
    async fn current_is_scoped() {
        assert_eq!(current(), None);
        let ctx = TraceContext::new_root();
        let seen = with_trace(ctx.clone(), async { current() }).await;
        assert_eq!(seen, Some(ctx));
        assert_eq!(current(), None);
    }
}
