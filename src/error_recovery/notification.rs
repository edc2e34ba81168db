//! Escalation of terminal failures to an operator-facing sink

use crate::error::ErrorReporter;
use crate::error_recovery::classifier::ClassifiedError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Receives terminal failures that need human attention
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, error: &ClassifiedError, operation: &str);
}

/// Default sink: one `error` level event per escalation
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, error: &ClassifiedError, operation: &str) {
        tracing::error!(
            operation,
            error_kind = error.kind.as_str(),
            severity = ?error.severity,
            attempts = error.attempts_made(),
            export = %ErrorReporter::export(error),
            "Escalating failure for manual remediation"
        );
    }
}

/// Sink that keeps escalations in memory, for callers that poll
#[derive(Debug, Default, Clone)]
pub struct MemoryNotifier {
    received: Arc<Mutex<Vec<(String, ClassifiedError)>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Escalations received so far as `(operation, error)` pairs
    pub async fn received(&self) -> Vec<(String, ClassifiedError)> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotifier {
    async fn notify(&self, error: &ClassifiedError, operation: &str) {
        self.received
            .lock()
            .await
            .push((operation.to_string(), error.clone()));
    }
}
