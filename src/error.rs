//! Error types for pipeline dependency calls
//!
//! `ResilienceError` is the raw failure a work function returns. It keeps the
//! signals the classifier needs (HTTP status, `Retry-After`, quota and
//! not-found markers) so that classification stays a pure mapping.

use crate::error_recovery::classifier::{ClassifiedError, Severity};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for work functions and crate operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Raw failures raised by wrapped dependency calls
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// Non-success HTTP response from a dependency
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },

    /// HTTP client errors
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Connection errors (reset, refused, dropped)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Dependency did not answer in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Explicit rate-limit signal without an HTTP response
    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Credential or API quota used up
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Requested resource absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Query succeeded but returned nothing usable
    #[error("Empty result: {0}")]
    EmptyResult(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Response did not match the expected schema
    #[error("Schema violation: {0}")]
    Schema(String),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential lookup errors
    #[error("Credential error: {0}")]
    Credentials(String),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller cancelled the operation
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl ResilienceError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limit<S: Into<String>>(msg: S, retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            retry_after,
            message: msg.into(),
        }
    }

    /// Create a quota exceeded error
    pub fn quota_exceeded<S: Into<String>>(msg: S) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an empty result error
    pub fn empty_result<S: Into<String>>(msg: S) -> Self {
        Self::EmptyResult(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a schema violation error
    pub fn schema<S: Into<String>>(msg: S) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a credentials error
    pub fn credentials<S: Into<String>>(msg: S) -> Self {
        Self::Credentials(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Generic(anyhow::anyhow!(msg.into()))
    }

    /// Build an HTTP error from a status code and optional `Retry-After` header value
    pub fn from_status<S: Into<String>>(status: u16, retry_after: Option<&str>, msg: S) -> Self {
        Self::Http {
            status,
            retry_after: retry_after.and_then(parse_retry_after),
            message: msg.into(),
        }
    }

    /// Build an HTTP error from a non-success response, consuming its body
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let message = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<unreadable body: {e}>"));

        Self::Http {
            status,
            retry_after,
            message,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Server-provided wait hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } | Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

/// Error logging and export utilities
pub struct ErrorReporter;

impl ErrorReporter {
    /// Log a classified error with a level matching its severity
    pub fn log_error(error: &ClassifiedError, operation: &str) {
        let kind = error.kind.as_str();
        match error.severity {
            Severity::Critical => {
                tracing::error!(
                    error_kind = kind,
                    operation,
                    recoverable = error.recoverable,
                    details = ?error.details,
                    "Critical failure: {}",
                    error.message
                );
            }
            Severity::High => {
                tracing::error!(
                    error_kind = kind,
                    operation,
                    recoverable = error.recoverable,
                    "Failure: {}",
                    error.message
                );
            }
            Severity::Medium => {
                tracing::warn!(
                    error_kind = kind,
                    operation,
                    recoverable = error.recoverable,
                    "Warning: {}",
                    error.message
                );
            }
            Severity::Low => {
                tracing::info!(
                    error_kind = kind,
                    operation,
                    recoverable = error.recoverable,
                    "Info: {}",
                    error.message
                );
            }
        }
    }

    /// Stable export object for logs and tests
    pub fn export(error: &ClassifiedError) -> serde_json::Value {
        serde_json::json!({
            "error_kind": error.kind.as_str(),
            "message": error.message,
            "details": error.details,
            "severity": error.severity,
            "recoverable": error.recoverable,
            "timestamp": error.timestamp.to_rfc3339(),
        })
    }

    /// Flat field map for metric labels
    pub fn generate_metrics(error: &ClassifiedError) -> HashMap<String, serde_json::Value> {
        HashMap::from([
            (
                "error_kind".to_string(),
                serde_json::Value::String(error.kind.as_str().to_string()),
            ),
            (
                "severity".to_string(),
                serde_json::Value::String(format!("{:?}", error.severity)),
            ),
            (
                "recoverable".to_string(),
                serde_json::Value::Bool(error.recoverable),
            ),
            (
                "strategy".to_string(),
                serde_json::Value::String(error.strategy.as_str().to_string()),
            ),
            (
                "timestamp".to_string(),
                serde_json::Value::String(error.timestamp.to_rfc3339()),
            ),
        ])
    }
}
