//! Forwarding validated MCP calls to upstream servers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::trace::{SPAN_HEADER, TRACE_HEADER, TraceContext};
use crate::config::UpstreamConfig;
use crate::{Error, Result};

/// Resolved server name header
pub const SERVER_HEADER: &str = "x-mcp-server";
/// Upstream call duration header
pub const DURATION_HEADER: &str = "x-mcp-duration-ms";
/// Call cost header
pub const COST_HEADER: &str = "x-mcp-cost";

/// MCP operation addressed by `/{kind}/{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `tools/call`
    ToolsCall,
    /// `tools/list`
    ToolsList,
    /// `resources/read`
    ResourcesRead,
    /// `resources/list`
    ResourcesList,
    /// `prompts/get`
    PromptsGet,
    /// `prompts/list`
    PromptsList,
}

impl Operation {
    /// Parse the two path segments after the server name
    #[must_use]
    pub fn parse(kind: &str, action: &str) -> Option<Self> {
        match (kind, action) {
            ("tools", "call") => Some(Self::ToolsCall),
            ("tools", "list") => Some(Self::ToolsList),
            ("resources", "read") => Some(Self::ResourcesRead),
            ("resources", "list") => Some(Self::ResourcesList),
            ("prompts", "get") => Some(Self::PromptsGet),
            ("prompts", "list") => Some(Self::PromptsList),
            _ => None,
        }
    }

    /// Upstream endpoint suffix
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::ToolsCall => "/tools/call",
            Self::ToolsList => "/tools/list",
            Self::ResourcesRead => "/resources/read",
            Self::ResourcesList => "/resources/list",
            Self::PromptsGet => "/prompts/get",
            Self::PromptsList => "/prompts/list",
        }
    }

    /// Body field the operation cannot do without
    #[must_use]
    pub fn required_field(self) -> Option<&'static str> {
        match self {
            Self::ToolsCall => Some("tool"),
            Self::ResourcesRead => Some("uri"),
            Self::PromptsGet => Some("name"),
            _ => None,
        }
    }

    /// Check the body carries the required field
    pub fn validate(self, body: &Value) -> Result<()> {
        let Some(field) = self.required_field() else {
            return Ok(());
        };
        let present = match self {
            // Tool name may also arrive as `name`
            Self::ToolsCall => tool_name(body).is_some(),
            _ => body.get(field).and_then(Value::as_str).is_some_and(|s| !s.is_empty()),
        };
        if present {
            Ok(())
        } else {
            Err(Error::Validation(format!("{field} is required")))
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path().trim_start_matches('/'))
    }
}

/// Tool named by a `tools/call` body: `tool`, falling back to `name`
#[must_use]
pub fn tool_name(body: &Value) -> Option<&str> {
    ["tool", "name"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// Pricing hook for forwarded calls.
pub trait CostModel: Send + Sync + 'static {
    /// Cost in USD of one call of `op` on `server`
    fn cost(&self, server: &str, op: Operation, body: &Value) -> f64;
}

/// Flat per-call price per server
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    per_call: HashMap<String, f64>,
}

impl StaticPricing {
    /// Prices taken from the server table
    #[must_use]
    pub fn from_servers(servers: &HashMap<String, UpstreamConfig>) -> Self {
        Self {
            per_call: servers
                .iter()
                .map(|(name, cfg)| (name.clone(), cfg.pricing.per_call))
                .collect(),
        }
    }
}

impl CostModel for StaticPricing {
    fn cost(&self, server: &str, _op: Operation, _body: &Value) -> f64 {
        self.per_call.get(server).copied().unwrap_or(0.0)
    }
}

/// Headers propagated to the upstream
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    /// Trace context of the request
    pub trace: Option<TraceContext>,
    /// Client address for `X-Forwarded-For`
    pub client_ip: Option<String>,
}

/// Upstream reply plus call metadata
#[derive(Debug, Clone)]
pub struct Forwarded {
    /// Server name
    pub server: String,
    /// Upstream status
    pub status: StatusCode,
    /// Upstream body
    pub body: Bytes,
    /// Upstream content type
    pub content_type: Option<HeaderValue>,
    /// Call duration
    pub duration: Duration,
    /// Computed cost
    pub cost: f64,
}

impl IntoResponse for Forwarded {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            self.content_type
                .unwrap_or_else(|| HeaderValue::from_static("application/json")),
        );
        if let Ok(v) = HeaderValue::from_str(&self.server) {
            headers.insert(SERVER_HEADER, v);
        }
        headers.insert(
            DURATION_HEADER,
            HeaderValue::from(u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)),
        );
        if let Ok(v) = HeaderValue::from_str(&format!("{:.6}", self.cost)) {
            headers.insert(COST_HEADER, v);
        }
        response
    }
}

/// Relays MCP calls to the configured upstream servers.
pub struct ProxyForwarder {
    client: Client,
    servers: HashMap<String, UpstreamConfig>,
    pricing: Arc<dyn CostModel>,
}

impl ProxyForwarder {
    /// Create a forwarder for `servers` with static per-call pricing
    pub fn new(servers: &HashMap<String, UpstreamConfig>) -> Result<Self> {
        Self::with_pricing(servers, Arc::new(StaticPricing::from_servers(servers)))
    }

    /// Create a forwarder with a custom pricing hook
    pub fn with_pricing(
        servers: &HashMap<String, UpstreamConfig>,
        pricing: Arc<dyn CostModel>,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            servers: servers.clone(),
            pricing,
        })
    }

    /// Configured server names, sorted
    #[must_use]
    pub fn servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `server` is configured
    #[must_use]
    pub fn has_server(&self, server: &str) -> bool {
        self.servers.contains_key(server)
    }

    /// Cost of one call, without forwarding it
    #[must_use]
    pub fn cost(&self, server: &str, op: Operation, body: &Value) -> f64 {
        self.pricing.cost(server, op, body)
    }

    /// Forward `body` verbatim to `server` under its deadline.
    ///
    /// `deadline` overrides the configured timeout when shorter.
    pub async fn forward(
        &self,
        server: &str,
        op: Operation,
        body: Bytes,
        ctx: &ForwardContext,
        deadline: Option<Duration>,
    ) -> Result<Forwarded> {
        let upstream = self
            .servers
            .get(server)
            .ok_or_else(|| Error::ServerNotFound(server.to_string()))?;
        let url = format!("{}{}", upstream.url.trim_end_matches('/'), op.path());
        let timeout = deadline.map_or(upstream.timeout, |d| d.min(upstream.timeout));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(trace) = &ctx.trace {
            if let Ok(v) = HeaderValue::from_str(&trace.trace_id) {
                headers.insert(TRACE_HEADER, v);
            }
            if let Ok(v) = HeaderValue::from_str(&trace.span_id) {
                headers.insert(SPAN_HEADER, v);
            }
        }
        if let Some(ip) = ctx.client_ip.as_deref().and_then(|ip| HeaderValue::from_str(ip).ok()) {
            headers.insert("x-forwarded-for", ip);
        }

        let cost = serde_json::from_slice::<Value>(&body)
            .map(|v| self.pricing.cost(server, op, &v))
            .unwrap_or_else(|_| self.pricing.cost(server, op, &Value::Null));

        let started = Instant::now();
        let sent = self
            .client
            .post(&url)
            .headers(headers)
            .timeout(timeout)
            .body(body)
            .send()
            .await;
        let response = match sent {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(server = %server, operation = %op, timeout_ms = timeout.as_millis(), "Upstream call timed out");
                return Err(Error::UpstreamTimeout(format!("{server}: {e}")));
            }
            Err(e) => {
                warn!(server = %server, operation = %op, error = %e, "Upstream call failed");
                return Err(Error::UpstreamUnavailable(format!("{server}: {e}")));
            }
        };

        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                Error::UpstreamTimeout(format!("{server}: {e}"))
            } else {
                Error::UpstreamUnavailable(format!("{server}: {e}"))
            }
        })?;
        let duration = started.elapsed();
        debug!(
            server = %server,
            operation = %op,
            status = status.as_u16(),
            duration_ms = duration.as_millis(),
            "Upstream call completed"
        );

        Ok(Forwarded {
            server: server.to_string(),
            status,
            body,
            content_type,
            duration,
            cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingConfig;
    use serde_json::json;

    fn servers() -> HashMap<String, UpstreamConfig> {
        HashMap::from([(
            "fs".to_string(),
            UpstreamConfig {
                url: "http://127.0.0.1:9".to_string(),
                timeout: Duration::from_secs(1),
                pricing: PricingConfig { per_call: 0.0025 },
            },
        )])
    }

    #[test]
    fn only_known_operations_parse() {
        assert_eq!(Operation::parse("tools", "call"), Some(Operation::ToolsCall));
        assert_eq!(Operation::parse("prompts", "list"), Some(Operation::PromptsList));
        assert_eq!(Operation::parse("tools", "delete"), None);
        assert_eq!(Operation::parse("sampling", "create"), None);
        assert_eq!(Operation::ResourcesRead.to_string(), "resources/read");
    }

    #[test]
    fn required_fields_are_checked() {
        assert!(Operation::ToolsCall.validate(&json!({"tool": "read_file"})).is_ok());
        assert!(Operation::ToolsCall.validate(&json!({"name": "read_file"})).is_ok());
        assert!(Operation::ToolsCall.validate(&json!({"arguments": {}})).is_err());
        assert!(Operation::ResourcesRead.validate(&json!({"uri": ""})).is_err());
        assert!(Operation::PromptsGet.validate(&json!({"name": "p"})).is_ok());
        assert!(Operation::ToolsList.validate(&json!({})).is_ok());
    }

    #[test]
    fn cost_header_has_six_decimals() {
        let resp = Forwarded {
            server: "fs".into(),
            status: StatusCode::OK,
            body: Bytes::from_static(b"{}"),
            content_type: None,
            duration: Duration::from_millis(42),
            cost: 0.0025,
        }
        .into_response();
        assert_eq!(resp.headers()[COST_HEADER], "0.002500");
        assert_eq!(resp.headers()[DURATION_HEADER], "42");
        assert_eq!(resp.headers()[SERVER_HEADER], "fs");
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let proxy = ProxyForwarder::new(&servers()).unwrap();
        let err = proxy
            .forward("nope", Operation::ToolsList, Bytes::new(), &ForwardContext::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerNotFound(_)));
        assert_eq!(proxy.cost("fs", Operation::ToolsCall, &Value::Null), 0.0025);
    }

    #[tokio::test]
    async fn refused_connection_is_upstream_error() {
        // GIVEN: a server entry pointing at a closed port
        let proxy = ProxyForwarder::new(&servers()).unwrap();

        // WHEN: a call is forwarded
        let err = proxy
            .forward("fs", Operation::ToolsList, Bytes::from_static(b"{}"), &ForwardContext::default(), None)
            .await
            .unwrap_err();

        // THEN: 502 without leaking the transport error
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.public_message(), "Failed to reach MCP server");
    }
}
