//! Concurrent fan-out of tool calls to one server.
//!
//! Every call passes the tool access check on its own and runs against a
//! shared deadline. Calls still in flight when the deadline passes are
//! reported as `timeout`; the others report what the upstream said.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::BatchConfig;
use crate::gateway::proxy::{ForwardContext, Operation, ProxyForwarder};
use crate::tools::{Caller, ToolAccessController};
use crate::{Error, Result};

/// Body of `POST /v1/mcp/{server}/tools/batch`
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    /// Calls to run
    pub calls: Vec<BatchCall>,
    /// Overall deadline in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// One call of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCall {
    /// Tool name
    #[serde(alias = "name")]
    pub tool: String,
    /// Tool arguments
    #[serde(default)]
    pub arguments: Value,
}

/// Per-call outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Upstream answered with 2xx
    Success,
    /// Upstream failed or answered with an error status
    Error,
    /// Tool access check refused the call
    Denied,
    /// Deadline passed before the call finished
    Timeout,
}

/// Result of one call
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    /// Position in the request
    pub index: usize,
    /// Tool name
    pub tool: String,
    /// Outcome
    pub status: CallStatus,
    /// Upstream body, when there was one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time of the call
    pub duration_ms: u64,
    /// Cost charged for the call
    pub cost: f64,
}

/// Aggregated batch response
#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    /// Server the batch ran against
    pub server: String,
    /// Per-call results in request order
    pub results: Vec<CallResult>,
    /// Sum of per-call costs
    pub total_cost: f64,
    /// Calls with status `success`
    pub succeeded: usize,
    /// Calls with any other status
    pub failed: usize,
    /// Wall time of the whole batch
    pub duration_ms: u64,
}

/// Runs batches of tool calls.
pub struct BatchExecutor {
    proxy: Arc<ProxyForwarder>,
    tools: Arc<ToolAccessController>,
    max_calls: usize,
    default_timeout: Duration,
}

impl BatchExecutor {
    /// Create an executor
    pub fn new(proxy: Arc<ProxyForwarder>, tools: Arc<ToolAccessController>, config: &BatchConfig) -> Self {
        Self {
            proxy,
            tools,
            max_calls: config.max_calls.max(1),
            default_timeout: config.default_timeout,
        }
    }

    /// Run every call of `request` against `server` concurrently
    pub async fn execute(
        &self,
        caller: Caller<'_>,
        server: &str,
        request: BatchRequest,
        ctx: &ForwardContext,
    ) -> Result<BatchResponse> {
        if request.calls.is_empty() {
            return Err(Error::Validation("calls must not be empty".to_string()));
        }
        if request.calls.len() > self.max_calls {
            return Err(Error::Validation(format!(
                "A batch may contain at most {} calls",
                self.max_calls
            )));
        }
        if let Some(call) = request.calls.iter().find(|c| c.tool.trim().is_empty()) {
            return Err(Error::Validation(format!("tool is required (got {:?})", call.tool)));
        }
        if !self.proxy.has_server(server) {
            return Err(Error::ServerNotFound(server.to_string()));
        }

        let budget = request
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map_or(self.default_timeout, Duration::from_millis);
        let started = Instant::now();
        let deadline = started + budget;
        let total_cost = Mutex::new(0.0_f64);

        let calls = request
            .calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| self.run_one(caller, server, index, call, ctx, deadline, &total_cost));
        let results = join_all(calls).await;

        let succeeded = results.iter().filter(|r| r.status == CallStatus::Success).count();
        let response = BatchResponse {
            server: server.to_string(),
            failed: results.len() - succeeded,
            succeeded,
            total_cost: *total_cost.lock(),
            duration_ms: millis(started.elapsed()),
            results,
        };
        info!(
            server = %server,
            calls = response.results.len(),
            succeeded = response.succeeded,
            total_cost = response.total_cost,
            "Batch completed"
        );
        Ok(response)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one(
        &self,
        caller: Caller<'_>,
        server: &str,
        index: usize,
        call: BatchCall,
        ctx: &ForwardContext,
        deadline: Instant,
        total_cost: &Mutex<f64>,
    ) -> CallResult {
        let started = Instant::now();
        let mut result = CallResult {
            index,
            tool: call.tool.clone(),
            status: CallStatus::Error,
            result: None,
            error: None,
            duration_ms: 0,
            cost: 0.0,
        };

        match self.tools.admit(caller, server, &call.tool).await {
            Ok(decision) if decision.allowed => {}
            Ok(decision) => {
                debug!(server = %server, tool = %call.tool, "Batch call denied");
                result.status = CallStatus::Denied;
                result.error = Some(decision.reason);
                return result;
            }
            Err(e) => {
                result.error = Some(e.public_message());
                return result;
            }
        }

        let body = json!({ "tool": call.tool, "arguments": call.arguments });
        let bytes = match serde_json::to_vec(&body) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let forwarded = tokio::time::timeout_at(
            deadline,
            self.proxy
                .forward(server, Operation::ToolsCall, bytes, ctx, Some(remaining)),
        )
        .await;

        match forwarded {
            Err(_) | Ok(Err(Error::UpstreamTimeout(_))) => {
                result.status = CallStatus::Timeout;
                result.error = Some("Batch deadline exceeded".to_string());
            }
            Ok(Err(e)) => {
                result.error = Some(e.public_message());
            }
            Ok(Ok(reply)) => {
                *total_cost.lock() += reply.cost;
                result.cost = reply.cost;
                let body = serde_json::from_slice::<Value>(&reply.body)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&reply.body).into_owned()));
                if reply.status.is_success() {
                    result.status = CallStatus::Success;
                } else {
                    result.error = Some(format!("Upstream returned {}", reply.status.as_u16()));
                }
                result.result = Some(body);
            }
        }
        result.duration_ms = millis(started.elapsed());
        result
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
