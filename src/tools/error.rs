//! Tool execution errors with retry classification.
//!
//! Distinguishes between transient errors (should retry) and permanent
//! errors (should not retry). Anything the pipeline cannot place is
//! `Unknown`, which the retry policy treats like `Permanent`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Temporary unavailability, timeouts - retry with backoff
    Transient,
    /// Invalid input, unknown tool, schema violation - never retry
    Permanent,
    /// Throttled by the downstream - retry, honoring any retry-after hint
    RateLimited,
    /// Unclassifiable - never retry
    Unknown,
}

impl ErrorClass {
    /// Check if this class of error is eligible for a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::RateLimited)
    }

    /// Map an HTTP status code, for handlers that wrap HTTP services.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            429 => ErrorClass::RateLimited,
            408 | 500 | 502 | 503 | 504 => ErrorClass::Transient,
            400..=499 => ErrorClass::Permanent,
            _ => ErrorClass::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::RateLimited => write!(f, "rate_limited"),
            ErrorClass::Unknown => write!(f, "unknown"),
        }
    }
}

/// A single offending argument field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised while resolving, validating or invoking a tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {}", join_fields(.fields))]
    InvalidArguments {
        tool: String,
        fields: Vec<FieldError>,
    },

    /// Failure reported by the handler itself, with its own classification.
    #[error("{class} tool failure: {message}")]
    Execution {
        message: String,
        class: ErrorClass,
        retry_after: Option<Duration>,
    },

    #[error("Tool {tool} timed out after {}ms", .timeout.as_millis())]
    Timeout { tool: String, timeout: Duration },

    #[error("Circuit open for {tool}, retry in {}ms", .retry_in.as_millis())]
    CircuitOpen { tool: String, retry_in: Duration },

    #[error("Tool {tool} panicked: {message}")]
    Panicked { tool: String, message: String },

    /// Anything a handler could not classify.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolError {
    /// A retryable handler failure (e.g. temporary unavailability).
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            class: ErrorClass::Transient,
            retry_after: None,
        }
    }

    /// A handler failure that must not be retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            class: ErrorClass::Permanent,
            retry_after: None,
        }
    }

    /// Throttled by the downstream, optionally with a server-supplied delay.
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Execution {
            message: message.into(),
            class: ErrorClass::RateLimited,
            retry_after,
        }
    }

    /// Map an HTTP failure onto a classified handler error.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        Self::Execution {
            message: format!("HTTP {}: {}", status, message.into()),
            class: ErrorClass::from_http_status(status),
            retry_after: None,
        }
    }

    /// Server- or breaker-supplied minimum delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ToolError::Execution { retry_after, .. } => *retry_after,
            ToolError::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    /// Whether the handler may have produced side effects.
    pub fn reached_handler(&self) -> bool {
        !matches!(
            self,
            ToolError::UnknownTool(_)
                | ToolError::InvalidArguments { .. }
                | ToolError::CircuitOpen { .. }
        )
    }
}
