use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds surfaced to callers and recorded in audit events.
///
/// The set is closed on purpose: transports map these to their own status
/// codes, and audit consumers key on the snake_case wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ToolNotFound,
    ValidationError,
    PolicyDenied,
    SecurityError,
    ConnectorError,
    Timeout,
    MaxBytesExceeded,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ToolNotFound => "tool_not_found",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::PolicyDenied => "policy_denied",
            ErrorCode::SecurityError => "security_error",
            ErrorCode::ConnectorError => "connector_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::MaxBytesExceeded => "max_bytes_exceeded",
            ErrorCode::InternalError => "internal_error",
        }
    }

    /// Suggested HTTP status for the HTTP facade.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::ToolNotFound => 404,
            ErrorCode::ValidationError => 400,
            ErrorCode::PolicyDenied | ErrorCode::SecurityError => 403,
            ErrorCode::ConnectorError => 500,
            ErrorCode::Timeout => 408,
            ErrorCode::MaxBytesExceeded => 413,
            ErrorCode::InternalError => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure carried from handlers and connectors up through the harness.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn tool_not_found(name: &str) -> Self {
        Self::new(ErrorCode::ToolNotFound, format!("unknown tool: {name}"))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn policy_denied(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::PolicyDenied, reason)
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SecurityError, message)
    }

    pub fn connector(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectorError, message)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("timed out after {timeout_ms}ms"),
        )
    }

    pub fn max_bytes(actual: usize, limit: u64) -> Self {
        Self::new(
            ErrorCode::MaxBytesExceeded,
            format!("result is {actual} bytes, limit is {limit}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}
