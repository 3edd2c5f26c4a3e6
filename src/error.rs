//! Error types for the policy gateway
//!
//! Every pipeline stage either passes a request on or terminates it with one
//! of these variants. Each variant knows its HTTP status, its machine-readable
//! code and the message that is safe to show the caller.

use std::io;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

/// Result type alias for the policy gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Policy gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing, malformed or invalid credential
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Principal lacks a required permission
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Tool classification or approval denies the call
    #[error("Tool access denied: {0}")]
    ToolAccessDenied(String),

    /// Quota for the current window is exhausted
    #[error("Rate limit exceeded, retry in {retry_after}s")]
    RateLimited {
        /// Seconds until the window resets
        retry_after: u64,
    },

    /// Safety detector blocked the payload
    #[error("Safety blocked ({kind}, {severity})")]
    SafetyBlocked {
        /// Detection severity
        severity: String,
        /// Detection type
        kind: String,
    },

    /// Upstream server could not be reached
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream call exceeded its deadline
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Malformed request body or missing field
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unknown upstream server name
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::ToolAccessDenied(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::SafetyBlocked { .. } | Self::Validation(_) | Self::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::UpstreamUnavailable(_) | Self::UpstreamTimeout(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) | Self::ServerNotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(_) | Self::Config(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::ToolAccessDenied(_) => "tool_access_denied",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::SafetyBlocked { .. } => "injection_detected",
            Self::UpstreamUnavailable(_) => "upstream_error",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Validation(_) | Self::Json(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::ServerNotFound(_) => "server_not_found",
            Self::Store(_) | Self::Config(_) | Self::Io(_) | Self::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// Message that is safe to return to the caller.
    ///
    /// Upstream bodies, store errors and internal details are never included.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::ToolAccessDenied(msg)
            | Self::Validation(msg)
            | Self::NotFound(msg) => msg.clone(),
            Self::RateLimited { retry_after } => {
                format!("Rate limit exceeded. Try again in {retry_after} seconds")
            }
            Self::SafetyBlocked { .. } => {
                "Request blocked: potential prompt injection detected".to_string()
            }
            Self::UpstreamUnavailable(_) => "Failed to reach MCP server".to_string(),
            Self::UpstreamTimeout(_) => "MCP server did not respond in time".to_string(),
            Self::ServerNotFound(name) => format!("MCP server '{name}' not found"),
            Self::Json(_) => "Request body is not valid JSON".to_string(),
            Self::Store(_) | Self::Config(_) | Self::Io(_) | Self::Internal(_) => {
                "Internal server error".to_string()
            }
        }
    }

    /// Structured details attached to the error body, if any
    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::SafetyBlocked { severity, kind } => {
                Some(json!({ "severity": severity, "type": kind }))
            }
            _ => None,
        }
    }

    /// Render the `{"error": {...}}` body
    #[must_use]
    pub fn to_body(&self) -> Value {
        let mut error = json!({
            "code": self.code(),
            "message": self.public_message(),
        });
        if let (Some(details), Some(obj)) = (self.details(), error.as_object_mut()) {
            obj.insert("details".to_string(), details);
        }
        json!({ "error": error })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }
        let mut response = (status, Json(self.to_body())).into_response();
        match self {
            Self::Unauthorized(_) => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            Self::RateLimited { retry_after } => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            }
            _ => {}
        }
        response
    }
}

/// Convert a structurally invalid credential into an authentication failure
impl From<gateway_core::CredentialError> for Error {
    fn from(e: gateway_core::CredentialError) -> Self {
        Self::Unauthorized(format!("Invalid API key format: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn taxonomy_statuses() {
        assert_eq!(Error::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::ToolAccessDenied("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::RateLimited { retry_after: 3 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(Error::UpstreamTimeout("x".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(Error::ServerNotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn safety_block_body_redacts_pattern() {
        let err = Error::SafetyBlocked {
            severity: "high".into(),
            kind: "prompt_injection".into(),
        };
        let body = err.to_body();
        assert_eq!(body["error"]["code"], "injection_detected");
        assert_eq!(body["error"]["details"]["severity"], "high");
        assert_eq!(body["error"]["details"]["type"], "prompt_injection");
        assert!(!body.to_string().contains("ignore"));
    }

    #[test]
    fn internal_details_are_not_echoed() {
        let err = Error::Store("connection refused to 10.0.0.3:5432".into());
        assert_eq!(err.public_message(), "Internal server error");
        assert!(!err.to_body().to_string().contains("10.0.0.3"));

        let err = Error::UpstreamUnavailable("upstream said: stack trace".into());
        assert_eq!(err.public_message(), "Failed to reach MCP server");
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let resp = Error::RateLimited { retry_after: 17 }.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "17");
    }

    #[test]
    fn unauthorized_response_challenges_bearer() {
        let resp = Error::Unauthorized("Missing credentials".into()).into_response();
        assert_eq!(resp.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }
}
