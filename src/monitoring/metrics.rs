//! Per-operation call metrics
//!
//! Every aggregate is a running value updated in O(1) per call; nothing is
//! recomputed from history. Each operation has its own lock so concurrent
//! stages recording different operations never contend, and updates to the
//! same operation are serialized without lost increments.

use crate::error_recovery::classifier::{ErrorKind, RecoveryStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Aggregated statistics for one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub name: String,
    pub total_calls: u64,
    pub success_calls: u64,
    pub fail_calls: u64,
    /// Seconds
    pub total_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub last_call_time: Option<DateTime<Utc>>,
    /// Recovery strategies taken after failed attempts
    pub strategy_counts: BTreeMap<RecoveryStrategy, u64>,
    /// Failures by classified kind
    pub error_counts: BTreeMap<ErrorKind, u64>,
}

impl OperationMetrics {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            total_calls: 0,
            success_calls: 0,
            fail_calls: 0,
            total_duration: 0.0,
            min_duration: 0.0,
            max_duration: 0.0,
            last_call_time: None,
            strategy_counts: BTreeMap::new(),
            error_counts: BTreeMap::new(),
        }
    }

    fn record(&mut self, duration: Duration, success: bool) {
        let secs = duration.as_secs_f64();
        if self.total_calls == 0 {
            self.min_duration = secs;
            self.max_duration = secs;
        } else {
            self.min_duration = self.min_duration.min(secs);
            self.max_duration = self.max_duration.max(secs);
        }

        self.total_calls += 1;
        if success {
            self.success_calls += 1;
        } else {
            self.fail_calls += 1;
        }
        self.total_duration += secs;
        self.last_call_time = Some(Utc::now());
    }

    /// Average duration in seconds, 0 when nothing was recorded
    pub fn avg_duration(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_duration / self.total_calls as f64
        }
    }

    /// Success rate in percent, 0 when nothing was recorded
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.success_calls as f64 * 100.0 / self.total_calls as f64
        }
    }

    /// Times a given strategy was taken
    pub fn strategy_count(&self, strategy: RecoveryStrategy) -> u64 {
        self.strategy_counts.get(&strategy).copied().unwrap_or(0)
    }
}

/// Exported view of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationExport {
    pub total_calls: u64,
    pub success_rate_pct: f64,
    pub avg_duration_seconds: f64,
    pub min_duration_seconds: f64,
    pub max_duration_seconds: f64,
    pub last_call_timestamp: Option<String>,
}

/// `(kind, operation)` pair that recurred past the frequency threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrequency {
    pub kind: ErrorKind,
    pub operation: String,
    pub count: usize,
}

/// Snapshot across all operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub operations: BTreeMap<String, OperationMetrics>,
    pub most_called: Option<String>,
    pub slowest_by_avg: Option<String>,
    pub frequent_errors: Vec<ErrorFrequency>,
}

/// Escalation threshold for recurring failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyConfig {
    /// Occurrences inside the window that count as frequent
    pub threshold: usize,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: Duration::from_secs(3600),
        }
    }
}

type FrequencyKey = (ErrorKind, String);

/// Process- or run-scoped metrics registry
pub struct MetricsTracker {
    operations: RwLock<HashMap<String, Arc<Mutex<OperationMetrics>>>>,
    error_windows: Mutex<HashMap<FrequencyKey, VecDeque<Instant>>>,
    frequency: FrequencyConfig,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(FrequencyConfig::default())
    }
}

impl MetricsTracker {
    pub fn new(frequency: FrequencyConfig) -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            error_windows: Mutex::new(HashMap::new()),
            frequency,
        }
    }

    async fn operation(&self, name: &str) -> Arc<Mutex<OperationMetrics>> {
        if let Some(op) = self.operations.read().await.get(name) {
            return op.clone();
        }
        self.operations
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OperationMetrics::new(name))))
            .clone()
    }

    /// Record one call outcome
    pub async fn record(&self, name: &str, duration: Duration, success: bool) {
        let op = self.operation(name).await;
        op.lock().await.record(duration, success);
        debug!(
            operation = name,
            duration_ms = duration.as_millis() as u64,
            success,
            "Recorded call"
        );
    }

    /// Record the recovery strategy taken after a failed attempt
    pub async fn record_strategy(&self, name: &str, strategy: RecoveryStrategy) {
        let op = self.operation(name).await;
        *op.lock().await.strategy_counts.entry(strategy).or_insert(0) += 1;
    }

    /// Count one failed attempt by kind
    pub async fn record_error(&self, name: &str, kind: ErrorKind) {
        let op = self.operation(name).await;
        *op.lock().await.error_counts.entry(kind).or_insert(0) += 1;
    }

    /// Record a call that failed for good; returns true when the `(kind, op)`
    /// pair has now reached the frequency threshold inside the window
    pub async fn record_failed_call(&self, name: &str, kind: ErrorKind) -> bool {
        let now = Instant::now();
        let mut windows = self.error_windows.lock().await;
        let window = windows.entry((kind, name.to_string())).or_default();
        window.push_back(now);
        prune(window, now, self.frequency.window);

        let frequent = window.len() >= self.frequency.threshold;
        if frequent {
            warn!(
                operation = name,
                error_kind = kind.as_str(),
                occurrences = window.len(),
                "Recurring failure crossed frequency threshold"
            );
        }
        frequent
    }

    /// Whether `(kind, op)` is currently above the frequency threshold
    pub async fn is_frequent(&self, name: &str, kind: ErrorKind) -> bool {
        let now = Instant::now();
        let mut windows = self.error_windows.lock().await;
        match windows.get_mut(&(kind, name.to_string())) {
            Some(window) => {
                prune(window, now, self.frequency.window);
                window.len() >= self.frequency.threshold
            }
            None => false,
        }
    }

    /// Metrics for one operation
    pub async fn get(&self, name: &str) -> Option<OperationMetrics> {
        let op = self.operations.read().await.get(name).cloned()?;
        let snapshot = op.lock().await.clone();
        Some(snapshot)
    }

    async fn snapshot(&self) -> BTreeMap<String, OperationMetrics> {
        let ops: Vec<_> = self.operations.read().await.values().cloned().collect();
        let mut out = BTreeMap::new();
        for op in ops {
            let metrics = op.lock().await.clone();
            out.insert(metrics.name.clone(), metrics);
        }
        out
    }

    /// Per-operation stats plus most-called, slowest and frequent failures
    pub async fn summary(&self) -> MetricsSummary {
        let operations = self.snapshot().await;

        let most_called = operations
            .values()
            .max_by_key(|m| m.total_calls)
            .filter(|m| m.total_calls > 0)
            .map(|m| m.name.clone());
        let slowest_by_avg = operations
            .values()
            .filter(|m| m.total_calls > 0)
            .max_by(|a, b| a.avg_duration().total_cmp(&b.avg_duration()))
            .map(|m| m.name.clone());

        let now = Instant::now();
        let mut windows = self.error_windows.lock().await;
        let mut frequent_errors: Vec<ErrorFrequency> = windows
            .iter_mut()
            .filter_map(|((kind, operation), window)| {
                prune(window, now, self.frequency.window);
                (window.len() >= self.frequency.threshold).then(|| ErrorFrequency {
                    kind: *kind,
                    operation: operation.clone(),
                    count: window.len(),
                })
            })
            .collect();
        frequent_errors.sort_by(|a, b| (&a.operation, a.kind).cmp(&(&b.operation, b.kind)));

        MetricsSummary {
            operations,
            most_called,
            slowest_by_avg,
            frequent_errors,
        }
    }

    /// Export view keyed by operation name
    pub async fn export(&self) -> BTreeMap<String, OperationExport> {
        self.snapshot()
            .await
            .into_iter()
            .map(|(name, m)| {
                let export = OperationExport {
                    total_calls: m.total_calls,
                    success_rate_pct: m.success_rate(),
                    avg_duration_seconds: m.avg_duration(),
                    min_duration_seconds: m.min_duration,
                    max_duration_seconds: m.max_duration,
                    last_call_timestamp: m.last_call_time.map(|t| t.to_rfc3339()),
                };
                (name, export)
            })
            .collect()
    }

    /// Drop one operation's metrics
    pub async fn reset_operation(&self, name: &str) {
        self.operations.write().await.remove(name);
        self.error_windows
            .lock()
            .await
            .retain(|(_, operation), _| operation != name);
    }

    /// Drop everything
    pub async fn reset(&self) {
        self.operations.write().await.clear();
        self.error_windows.lock().await.clear();
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) > span {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_is_commutative() {
        let forward = MetricsTracker::default();
        forward.record("render", Duration::from_secs(1), true).await;
        forward.record("render", Duration::from_secs(3), false).await;

        let reverse = MetricsTracker::default();
        reverse.record("render", Duration::from_secs(3), false).await;
        reverse.record("render", Duration::from_secs(1), true).await;

        for tracker in [&forward, &reverse] {
            let m = tracker.get("render").await.unwrap();
            assert_eq!(m.total_calls, 2);
            assert_eq!(m.success_rate(), 50.0);
            assert_eq!(m.avg_duration(), 2.0);
            assert_eq!(m.min_duration, 1.0);
            assert_eq!(m.max_duration, 3.0);
        }
    }

    #[tokio::test]
    async fn test_summary_picks_most_called_and_slowest() {
        let tracker = MetricsTracker::default();
        tracker.record("fetch_transcript", Duration::from_millis(100), true).await;
        tracker.record("fetch_transcript", Duration::from_millis(300), true).await;
        tracker.record("generate_script", Duration::from_secs(5), true).await;

        let summary = tracker.summary().await;
        assert_eq!(summary.most_called.as_deref(), Some("fetch_transcript"));
        assert_eq!(summary.slowest_by_avg.as_deref(), Some("generate_script"));
        assert_eq!(summary.operations.len(), 2);
        assert!(summary.frequent_errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_frequency_window() {
        let tracker = MetricsTracker::new(FrequencyConfig {
            threshold: 2,
            window: Duration::from_secs(60),
        });

        tracker.record_error("upload", ErrorKind::ExternalService).await;
        tracker.record_error("upload", ErrorKind::ExternalService).await;
        tracker.record_error("upload", ErrorKind::ExternalService).await;
        // Attempt counts alone never feed the window
        assert!(!tracker.is_frequent("upload", ErrorKind::ExternalService).await);

        assert!(!tracker.record_failed_call("upload", ErrorKind::ExternalService).await);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!tracker.record_failed_call("upload", ErrorKind::ExternalService).await);
        assert!(tracker.record_failed_call("upload", ErrorKind::ExternalService).await);
        assert!(!tracker.is_frequent("upload", ErrorKind::RateLimit).await);

        let summary = tracker.summary().await;
        assert_eq!(
            summary.frequent_errors,
            vec![ErrorFrequency {
                kind: ErrorKind::ExternalService,
                operation: "upload".to_string(),
                count: 2,
            }]
        );
        assert_eq!(
            summary.operations["upload"].error_counts[&ErrorKind::ExternalService],
            3
        );
    }

    #[tokio::test]
    async fn test_concurrent_records_are_not_lost() {
        let tracker = Arc::new(MetricsTracker::default());
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    tracker
                        .record("tags", Duration::from_millis(10), i % 2 == 0)
                        .await;
                })
            })
            .collect();
        futures::future::join_all(handles).await;

        let m = tracker.get("tags").await.unwrap();
        assert_eq!(m.total_calls, 32);
        assert_eq!(m.success_calls, 16);
    }

    #[tokio::test]
    async fn test_export_and_reset() {
        let tracker = MetricsTracker::default();
        tracker.record("thumbnail", Duration::from_millis(500), true).await;
        tracker.record_strategy("thumbnail", RecoveryStrategy::Fallback).await;

        let export = tracker.export().await;
        assert_eq!(export["thumbnail"].total_calls, 1);
        assert_eq!(export["thumbnail"].success_rate_pct, 100.0);
        assert!(export["thumbnail"].last_call_timestamp.is_some());

        tracker.reset_operation("thumbnail").await;
        assert!(tracker.get("thumbnail").await.is_none());
        tracker.record("other", Duration::ZERO, true).await;
        tracker.reset().await;
        assert!(tracker.summary().await.operations.is_empty());
    }
}
