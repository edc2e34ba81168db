//! Tests for failure classification and error export

use pipeline_resilience::error::parse_retry_after;
use pipeline_resilience::error_recovery::ClassifyContext;
use pipeline_resilience::{
    DependencyId, ErrorClassifier, ErrorKind, ErrorReporter, RecoveryStrategy, ResilienceError,
    Severity,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn classify(error: ResilienceError) -> pipeline_resilience::ClassifiedError {
    let ctx = ClassifyContext::new("generate_script")
        .with_dependency(DependencyId::new("model-api"))
        .with_attempt(2);
    ErrorClassifier::new().classify(&error, &ctx)
}

#[tokio::test]
async fn test_rate_limit_with_retry_after_header() {
    let classified = classify(ResilienceError::from_status(429, Some("30"), "Too Many Requests"));

    assert_eq!(classified.kind, ErrorKind::RateLimit);
    assert_eq!(classified.strategy, RecoveryStrategy::WaitRetry);
    assert_eq!(classified.severity, Severity::Medium);
    assert!(classified.recoverable);
    assert_eq!(classified.details["retry_after"], 30);
    assert_eq!(classified.retry_after(), Some(Duration::from_secs(30)));
}

#[tokio::test]
async fn test_rate_limit_without_header_uses_default_wait() {
    let classified = classify(ResilienceError::rate_limit("slow down", None));
    assert_eq!(classified.details["retry_after"], 60);

    let custom = ErrorClassifier::new()
        .with_default_rate_limit_wait(Duration::from_secs(90))
        .classify(
            &ResilienceError::from_status(429, None, "slow down"),
            &ClassifyContext::new("upload_video"),
        );
    assert_eq!(custom.retry_after(), Some(Duration::from_secs(90)));
}

#[tokio::test]
async fn test_export_has_stable_field_set() {
    let classified = classify(ResilienceError::not_found("video removed"));
    let export = ErrorReporter::export(&classified);

    let mut keys: Vec<_> = export.as_object().unwrap().keys().cloned().collect();
    keys.sort();
    assert_eq!(
        keys,
        vec!["details", "error_kind", "message", "recoverable", "severity", "timestamp"]
    );
    assert_eq!(export["error_kind"], "RESOURCE_NOT_FOUND");
    assert_eq!(export["severity"], "MEDIUM");

    // Logged at warn; must not panic without a subscriber
    ErrorReporter::log_error(&classified, "select_video");

    let metrics = ErrorReporter::generate_metrics(&classified);
    assert_eq!(metrics["strategy"], "FALLBACK");
    assert_eq!(metrics["recoverable"], true);
}

#[tokio::test]
async fn test_classified_error_round_trips_through_json() {
    let classified = classify(ResilienceError::timeout("model call timed out"));
    let json = serde_json::to_string(&classified).unwrap();
    let back: pipeline_resilience::ClassifiedError = serde_json::from_str(&json).unwrap();

    assert_eq!(back.kind, ErrorKind::ExternalService);
    assert_eq!(back.message, classified.message);
    assert_eq!(back.details, classified.details);
}

#[test]
fn test_retry_after_http_date_in_future() {
    let at = chrono::Utc::now() + chrono::Duration::seconds(120);
    let wait = parse_retry_after(&at.to_rfc2822()).unwrap();
    assert!(wait > Duration::from_secs(100) && wait <= Duration::from_secs(120));
}
