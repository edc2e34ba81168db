//! Failure classification
//!
//! Maps a raw [`ResilienceError`] plus call context onto a [`ClassifiedError`]
//! carrying kind, severity, recoverability and the recommended recovery
//! strategy. Behaviour per kind comes from a fixed lookup table
//! ([`ErrorKind::profile`]); the classifier itself only decides the kind.

use crate::error::ResilienceError;
use crate::error_recovery::DependencyId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Normalized failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Missing or invalid static configuration
    Configuration,
    /// Malformed input or schema violation
    Validation,
    /// Requested resource absent
    ResourceNotFound,
    /// 5xx, connection reset, dependency timeout
    ExternalService,
    /// Throttled by the dependency
    RateLimit,
    /// Credential quota spent
    QuotaExceeded,
    /// Breaker refused the call
    CircuitOpen,
    /// Every pool entry is disabled
    ResourceExhausted,
    /// Overall deadline expired or call cancelled
    Timeout,
    /// Anything unmapped
    Unknown,
}

/// Severity levels for logging and escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Recovery strategy recommended for a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    /// Give up immediately
    None,
    /// Retry without delay
    Retry,
    /// Retry after an exponentially growing delay
    RetryBackoff,
    /// Wait for the dependency-provided delay, then retry
    WaitRetry,
    /// Rotate to the next resource in the pool
    Fallback,
    /// Stop calling the dependency until the breaker cools down
    CircuitBreak,
}

/// Behaviour attached to a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindProfile {
    pub severity: Severity,
    pub recoverable: bool,
    pub strategy: RecoveryStrategy,
}

impl ErrorKind {
    /// Lookup table: severity, recoverability and strategy per kind
    pub const fn profile(self) -> KindProfile {
        use RecoveryStrategy as S;
        use Severity as Sev;

        let (severity, recoverable, strategy) = match self {
            ErrorKind::RateLimit => (Sev::Medium, true, S::WaitRetry),
            ErrorKind::ExternalService => (Sev::High, true, S::RetryBackoff),
            ErrorKind::ResourceNotFound => (Sev::Medium, true, S::Fallback),
            ErrorKind::QuotaExceeded => (Sev::High, true, S::Fallback),
            ErrorKind::Validation => (Sev::Low, false, S::None),
            ErrorKind::Configuration => (Sev::Critical, false, S::None),
            ErrorKind::CircuitOpen => (Sev::Medium, true, S::None),
            ErrorKind::ResourceExhausted => (Sev::Critical, false, S::None),
            ErrorKind::Timeout => (Sev::High, false, S::None),
            ErrorKind::Unknown => (Sev::High, false, S::None),
        };

        KindProfile {
            severity,
            recoverable,
            strategy,
        }
    }

    /// Stable export name
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "CONFIGURATION",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorKind::ExternalService => "EXTERNAL_SERVICE",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RecoveryStrategy {
    /// Stable export name
    pub const fn as_str(self) -> &'static str {
        match self {
            RecoveryStrategy::None => "NONE",
            RecoveryStrategy::Retry => "RETRY",
            RecoveryStrategy::RetryBackoff => "RETRY_BACKOFF",
            RecoveryStrategy::WaitRetry => "WAIT_RETRY",
            RecoveryStrategy::Fallback => "FALLBACK",
            RecoveryStrategy::CircuitBreak => "CIRCUIT_BREAK",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized failure record, created fresh for every failed attempt
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    #[serde(rename = "error_kind")]
    pub kind: ErrorKind,
    pub message: String,
    pub details: HashMap<String, serde_json::Value>,
    pub severity: Severity,
    pub recoverable: bool,
    pub strategy: RecoveryStrategy,
    pub timestamp: DateTime<Utc>,
}

impl ClassifiedError {
    /// Build an error whose behaviour comes from the kind's profile
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        let profile = kind.profile();
        Self {
            kind,
            message: message.into(),
            details: HashMap::new(),
            severity: profile.severity,
            recoverable: profile.recoverable,
            strategy: profile.strategy,
            timestamp: Utc::now(),
        }
    }

    /// Attach a detail entry
    pub fn with_detail<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Insert a detail entry in place
    pub fn set_detail<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.details.insert(key.into(), value.into());
    }

    /// Classified wait hint (`retry_after_ms`, falling back to whole seconds)
    pub fn retry_after(&self) -> Option<Duration> {
        if let Some(ms) = self.details.get("retry_after_ms").and_then(|v| v.as_u64()) {
            return Some(Duration::from_millis(ms));
        }
        self.details
            .get("retry_after")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
    }

    /// Attempts recorded on a terminal error
    pub fn attempts_made(&self) -> Option<u32> {
        self.details
            .get("attempts_made")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
    }

    /// Whether escalation to a notification is warranted by severity alone
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Context a failure is classified in
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub operation: String,
    pub dependency: Option<DependencyId>,
    pub attempt: u32,
}

impl ClassifyContext {
    pub fn new<S: Into<String>>(operation: S) -> Self {
        Self {
            operation: operation.into(),
            dependency: None,
            attempt: 1,
        }
    }

    pub fn with_dependency(mut self, dependency: DependencyId) -> Self {
        self.dependency = Some(dependency);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Message pattern mapped onto a kind, applied to otherwise unmapped errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    pub kind: ErrorKind,
}

impl PatternRule {
    pub fn new<S: Into<String>>(pattern: S, kind: ErrorKind) -> Self {
        Self {
            pattern: pattern.into().to_lowercase(),
            kind,
        }
    }
}

/// Maps raw failures onto classified errors
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    pattern_rules: Vec<PatternRule>,
    default_rate_limit_wait: Duration,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            pattern_rules: default_pattern_rules(),
            default_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

fn default_pattern_rules() -> Vec<PatternRule> {
    vec![
        PatternRule::new("quota", ErrorKind::QuotaExceeded),
        PatternRule::new("rate limit", ErrorKind::RateLimit),
        PatternRule::new("too many requests", ErrorKind::RateLimit),
        PatternRule::new("timed out", ErrorKind::ExternalService),
        PatternRule::new("connection reset", ErrorKind::ExternalService),
        PatternRule::new("service unavailable", ErrorKind::ExternalService),
        PatternRule::new("not found", ErrorKind::ResourceNotFound),
    ]
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait applied to rate limits that carry no `Retry-After`
    pub fn with_default_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.default_rate_limit_wait = wait;
        self
    }

    /// Add a message pattern; custom rules take precedence over the defaults
    pub fn with_pattern<S: Into<String>>(mut self, pattern: S, kind: ErrorKind) -> Self {
        self.pattern_rules.insert(0, PatternRule::new(pattern, kind));
        self
    }

    /// Classify a raw failure. Never fails; unknown shapes become `UNKNOWN`.
    pub fn classify(&self, error: &ResilienceError, ctx: &ClassifyContext) -> ClassifiedError {
        let kind = self.kind_of(error);
        let mut classified = ClassifiedError::new(kind, error.to_string())
            .with_detail("operation", ctx.operation.clone())
            .with_detail("attempt", ctx.attempt);

        if let Some(dependency) = &ctx.dependency {
            classified.set_detail("dependency", dependency.as_str());
        }
        if let Some(status) = error.status() {
            classified.set_detail("status", status);
        }

        let wait = match kind {
            ErrorKind::RateLimit => Some(error.retry_after().unwrap_or(self.default_rate_limit_wait)),
            _ => error.retry_after(),
        };
        if let Some(wait) = wait {
            classified.set_detail("retry_after", wait.as_secs());
            classified.set_detail(
                "retry_after_ms",
                u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            );
        }

        classified
    }

    fn kind_of(&self, error: &ResilienceError) -> ErrorKind {
        match error {
            ResilienceError::Http {
                status, message, ..
            } => self
                .kind_for_status(*status, message)
                .unwrap_or_else(|| self.kind_from_patterns(message)),
            ResilienceError::Request(e) => {
                if e.is_timeout() || e.is_connect() {
                    ErrorKind::ExternalService
                } else if let Some(status) = e.status() {
                    self.kind_for_status(status.as_u16(), &e.to_string())
                        .unwrap_or(ErrorKind::Unknown)
                } else if e.is_decode() {
                    ErrorKind::Validation
                } else {
                    self.kind_from_patterns(&e.to_string())
                }
            }
            ResilienceError::Connection(_) | ResilienceError::Timeout(_) => {
                ErrorKind::ExternalService
            }
            ResilienceError::RateLimit { .. } => ErrorKind::RateLimit,
            ResilienceError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            ResilienceError::NotFound(_) | ResilienceError::EmptyResult(_) => {
                ErrorKind::ResourceNotFound
            }
            ResilienceError::InvalidInput(_)
            | ResilienceError::Schema(_)
            | ResilienceError::Json(_) => ErrorKind::Validation,
            ResilienceError::Config(_) | ResilienceError::Credentials(_) => {
                ErrorKind::Configuration
            }
            ResilienceError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::TimedOut => ErrorKind::ExternalService,
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    ErrorKind::Configuration
                }
                _ => self.kind_from_patterns(&e.to_string()),
            },
            ResilienceError::Cancelled(_) => ErrorKind::Timeout,
            ResilienceError::Generic(e) => self.kind_from_patterns(&e.to_string()),
        }
    }

    fn kind_for_status(&self, status: u16, message: &str) -> Option<ErrorKind> {
        match status {
            429 => Some(ErrorKind::RateLimit),
            403 if message.to_lowercase().contains("quota") => Some(ErrorKind::QuotaExceeded),
            401 | 403 => Some(ErrorKind::Configuration),
            404 | 410 => Some(ErrorKind::ResourceNotFound),
            408 | 500..=599 => Some(ErrorKind::ExternalService),
            400 | 422 => Some(ErrorKind::Validation),
            _ => None,
        }
    }

    fn kind_from_patterns(&self, message: &str) -> ErrorKind {
        let message = message.to_lowercase();
        self.pattern_rules
            .iter()
            .find(|rule| message.contains(&rule.pattern))
            .map(|rule| rule.kind)
            .unwrap_or(ErrorKind::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ctx() -> ClassifyContext {
        ClassifyContext::new("upload_video").with_dependency(DependencyId::new("video-platform"))
    }

    #[rstest]
    #[case(ResilienceError::from_status(503, None, "backend down"), ErrorKind::ExternalService)]
    #[case(ResilienceError::connection("connection reset by peer"), ErrorKind::ExternalService)]
    #[case(ResilienceError::timeout("model call"), ErrorKind::ExternalService)]
    #[case(ResilienceError::from_status(404, None, "video missing"), ErrorKind::ResourceNotFound)]
    #[case(ResilienceError::empty_result("search returned nothing"), ErrorKind::ResourceNotFound)]
    #[case(ResilienceError::schema("missing field title"), ErrorKind::Validation)]
    #[case(ResilienceError::credentials("no API key configured"), ErrorKind::Configuration)]
    #[case(ResilienceError::from_status(403, None, "quotaExceeded: daily quota"), ErrorKind::QuotaExceeded)]
    #[case(ResilienceError::from_status(403, None, "forbidden"), ErrorKind::Configuration)]
    #[case(ResilienceError::internal("something odd"), ErrorKind::Unknown)]
    #[case(ResilienceError::internal("Too Many Requests"), ErrorKind::RateLimit)]
    #[case(ResilienceError::Cancelled("shutdown".into()), ErrorKind::Timeout)]
    fn test_classification_table(#[case] error: ResilienceError, #[case] expected: ErrorKind) {
        let classified = ErrorClassifier::new().classify(&error, &ctx());
        assert_eq!(classified.kind, expected);
        let profile = expected.profile();
        assert_eq!(classified.severity, profile.severity);
        assert_eq!(classified.recoverable, profile.recoverable);
        assert_eq!(classified.strategy, profile.strategy);
    }

    #[test]
    fn test_rate_limit_uses_retry_after_header() {
        let error = ResilienceError::from_status(429, Some("30"), "Too Many Requests");
        let classified = ErrorClassifier::new().classify(&error, &ctx());

        assert_eq!(classified.kind, ErrorKind::RateLimit);
        assert_eq!(classified.strategy, RecoveryStrategy::WaitRetry);
        assert_eq!(classified.details["retry_after"], serde_json::json!(30));
        assert_eq!(classified.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(classified.details["status"], serde_json::json!(429));
    }

    #[test]
    fn test_rate_limit_without_header_defaults_to_sixty_seconds() {
        let error = ResilienceError::rate_limit("throttled", None);
        let classified = ErrorClassifier::new().classify(&error, &ctx());
        assert_eq!(classified.retry_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_huge_retry_after_saturates() {
        let error = ResilienceError::from_status(429, Some("18446744073709552"), "Too Many Requests");
        let classified = ErrorClassifier::new().classify(&error, &ctx());

        assert_eq!(classified.details["retry_after_ms"], serde_json::json!(u64::MAX));
        assert!(classified.retry_after().unwrap() > Duration::from_secs(365 * 24 * 3600));
    }

    #[test]
    fn test_custom_pattern_takes_precedence() {
        let classifier = ErrorClassifier::new().with_pattern("not found", ErrorKind::Validation);
        let classified = classifier.classify(&ResilienceError::internal("thing not found"), &ctx());
        assert_eq!(classified.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_details_carry_call_context() {
        let classified = ErrorClassifier::new().classify(
            &ResilienceError::internal("boom"),
            &ctx().with_attempt(2),
        );
        assert_eq!(classified.details["operation"], "upload_video");
        assert_eq!(classified.details["dependency"], "video-platform");
        assert_eq!(classified.details["attempt"], 2);
    }
}
