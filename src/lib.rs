//! MCP Policy Gateway Library
//!
//! Policy-enforcement gateway in front of Model Context Protocol servers.
//!
//! # Pipeline
//!
//! Every `POST /v1/mcp/{server}/{kind}/{action}` passes, in order:
//!
//! - **Trace context**: `X-Trace-ID` / `X-Span-ID` correlation
//! - **Identity**: API key or session into a [`identity::Principal`]
//! - **Permissions**: role and wildcard resolution ([`rbac`])
//! - **Rate limiting**: fixed-window quota per key ([`ratelimit`])
//! - **Safety**: prompt-injection detection ([`safety`])
//! - **Tool access**: risk classes, grants and approvals ([`tools`])
//! - **Proxy**: forwarding with cost and duration metadata ([`gateway::proxy`])
//!
//! with the [`audit`] recorder wrapping the chain.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod ratelimit;
pub mod rbac;
pub mod safety;
pub mod tools;
pub mod worker;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install subscriber: {e}")))?,
    }

    Ok(())
}
