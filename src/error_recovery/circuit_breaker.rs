//! Circuit breaker pattern implementation for dependency calls
//!
//! One breaker per [`DependencyId`], created lazily by the
//! [`CircuitBreakerRegistry`] and kept for the process lifetime. Each breaker
//! serializes its own transitions behind a mutex, so `allow`,
//! `record_success` and `record_failure` are linearizable per dependency
//! while different dependencies never contend.

use crate::error_recovery::DependencyId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - calls rejected without execution
    Open,
    /// Circuit is half-open - one trial call allowed
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Cooldown after the last failure before a trial call is allowed
    #[serde(with = "humantime_serde")]
    pub timeout_duration: Duration,
    /// Enable per-call debug logging
    pub detailed_logging: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_duration: Duration::from_secs(60),
            detailed_logging: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create configuration for critical services
    pub fn critical_service() -> Self {
        Self {
            failure_threshold: 3,
            timeout_duration: Duration::from_secs(30),
            detailed_logging: true,
        }
    }

    /// Create configuration for non-critical services
    pub fn non_critical_service() -> Self {
        Self {
            failure_threshold: 10,
            timeout_duration: Duration::from_secs(120),
            detailed_logging: false,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub dependency: DependencyId,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub blocked_requests: u64,
    pub circuit_open_count: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Milliseconds until an open circuit admits a trial call
    pub time_until_half_open_ms: Option<u64>,
}

/// State transition event
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerEvent {
    pub dependency: DependencyId,
    pub timestamp: DateTime<Utc>,
    pub previous_state: CircuitState,
    pub new_state: CircuitState,
    pub failure_count: u32,
}

/// Receives breaker state transitions
#[async_trait::async_trait]
pub trait CircuitBreakerListener: Send + Sync {
    async fn on_transition(&self, event: &CircuitBreakerEvent);
}

/// Internal circuit breaker state
struct BreakerState {
    current_state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    blocked_requests: u64,
    circuit_open_count: u64,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            current_state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            trial_in_flight: false,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            blocked_requests: 0,
            circuit_open_count: 0,
            last_failure: None,
            last_success: None,
        }
    }

    fn cooldown_elapsed(&self, timeout: Duration) -> bool {
        self.last_failure_time
            .map(|at| at.elapsed() > timeout)
            .unwrap_or(true)
    }
}

/// Circuit breaker for a single dependency
pub struct CircuitBreaker {
    dependency: DependencyId,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    event_listeners: RwLock<Vec<Arc<dyn CircuitBreakerListener>>>,
}

impl CircuitBreaker {
    /// Create new circuit breaker
    pub fn new(dependency: DependencyId, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency,
            config,
            state: Mutex::new(BreakerState::new()),
            event_listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn dependency(&self) -> &DependencyId {
        &self.dependency
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a call may proceed.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// admits exactly one trial call; further calls are refused until that
    /// trial records its outcome.
    pub async fn allow(&self) -> bool {
        let mut state = self.state.lock().await;
        state.total_requests += 1;

        let (allowed, transition) = match state.current_state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                if state.cooldown_elapsed(self.config.timeout_duration) {
                    state.current_state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    info!(
                        dependency = %self.dependency,
                        "Circuit breaker transitioning to half-open"
                    );
                    (
                        true,
                        Some((CircuitState::Open, CircuitState::HalfOpen, state.failure_count)),
                    )
                } else {
                    (false, None)
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    (false, None)
                } else {
                    state.trial_in_flight = true;
                    (true, None)
                }
            }
        };

        if !allowed {
            state.blocked_requests += 1;
            if self.config.detailed_logging {
                debug!(dependency = %self.dependency, "Circuit breaker blocking request");
            }
        }
        drop(state);

        if let Some((previous, new, failures)) = transition {
            self.emit(previous, new, failures).await;
        }
        allowed
    }

    /// Record successful operation; always resets the failure count
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.successful_requests += 1;
        state.last_success = Some(Utc::now());
        state.failure_count = 0;
        state.trial_in_flight = false;

        let previous = state.current_state;
        match previous {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                state.current_state = CircuitState::Closed;
                info!(dependency = %self.dependency, "Circuit breaker closed after successful trial");
            }
            CircuitState::Open => {
                state.current_state = CircuitState::Closed;
                warn!(
                    dependency = %self.dependency,
                    "Success recorded while circuit open, closing"
                );
            }
        }
        let new = state.current_state;
        drop(state);

        if previous != new {
            self.emit(previous, new, 0).await;
        }
    }

    /// Record failed operation
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.failed_requests += 1;
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_time = Some(Instant::now());
        state.last_failure = Some(Utc::now());
        state.trial_in_flight = false;

        let previous = state.current_state;
        match previous {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    state.current_state = CircuitState::Open;
                    state.circuit_open_count += 1;
                    error!(
                        dependency = %self.dependency,
                        failures = state.failure_count,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.current_state = CircuitState::Open;
                state.circuit_open_count += 1;
                warn!(dependency = %self.dependency, "Circuit breaker reopened after failed trial");
            }
            CircuitState::Open => {
                debug!(dependency = %self.dependency, "Failure recorded while circuit is open");
            }
        }
        let new = state.current_state;
        let failures = state.failure_count;
        drop(state);

        if previous != new {
            self.emit(previous, new, failures).await;
        }
    }

    /// Release a half-open trial whose call was abandoned before completing
    pub async fn abandon_trial(&self) {
        let mut state = self.state.lock().await;
        if state.current_state == CircuitState::HalfOpen {
            state.trial_in_flight = false;
        }
    }

    /// Current state without side effects
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.current_state
    }

    /// Get current statistics
    pub async fn get_stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock().await;

        let time_until_half_open_ms = match (state.current_state, state.last_failure_time) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .timeout_duration
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };

        CircuitBreakerStats {
            dependency: self.dependency.clone(),
            state: state.current_state,
            failure_count: state.failure_count,
            failure_threshold: self.config.failure_threshold,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            blocked_requests: state.blocked_requests,
            circuit_open_count: state.circuit_open_count,
            last_failure: state.last_failure,
            last_success: state.last_success,
            time_until_half_open_ms,
        }
    }

    /// Reset circuit breaker to closed
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        let previous = state.current_state;
        state.current_state = CircuitState::Closed;
        state.failure_count = 0;
        state.last_failure_time = None;
        state.trial_in_flight = false;
        drop(state);

        info!(dependency = %self.dependency, "Circuit breaker reset to closed state");
        if previous != CircuitState::Closed {
            self.emit(previous, CircuitState::Closed, 0).await;
        }
    }

    /// Add event listener
    pub async fn add_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.event_listeners.write().await.push(listener);
    }

    async fn emit(&self, previous_state: CircuitState, new_state: CircuitState, failures: u32) {
        let event = CircuitBreakerEvent {
            dependency: self.dependency.clone(),
            timestamp: Utc::now(),
            previous_state,
            new_state,
            failure_count: failures,
        };

        let listeners = self.event_listeners.read().await;
        for listener in listeners.iter() {
            listener.on_transition(&event).await;
        }
    }
}

/// Get-or-create registry of breakers keyed by dependency
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<DependencyId, Arc<CircuitBreaker>>>,
    overrides: RwLock<HashMap<DependencyId, CircuitBreakerConfig>>,
    listeners: RwLock<Vec<Arc<dyn CircuitBreakerListener>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create new registry
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            default_config,
        }
    }

    /// Set the configuration a dependency's breaker is created with.
    ///
    /// Has no effect on a breaker that already exists.
    pub async fn configure(&self, dependency: DependencyId, config: CircuitBreakerConfig) {
        if self.breakers.read().await.contains_key(&dependency) {
            warn!(%dependency, "Breaker already created, configuration ignored");
            return;
        }
        self.overrides.write().await.insert(dependency, config);
    }

    /// Existing breaker for a dependency, if any
    pub async fn get(&self, dependency: &DependencyId) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(dependency).cloned()
    }

    /// Get or create the breaker for a dependency
    pub async fn get_breaker(&self, dependency: &DependencyId) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(dependency) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get(dependency) {
            return breaker.clone();
        }

        let config = self
            .overrides
            .read()
            .await
            .get(dependency)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone());
        let breaker = Arc::new(CircuitBreaker::new(dependency.clone(), config));
        for listener in self.listeners.read().await.iter() {
            breaker.add_listener(listener.clone()).await;
        }
        breakers.insert(dependency.clone(), breaker.clone());

        info!(%dependency, "Created new circuit breaker");
        breaker
    }

    /// Attach a listener to every current and future breaker
    pub async fn add_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        for breaker in self.breakers.read().await.values() {
            breaker.add_listener(listener.clone()).await;
        }
        self.listeners.write().await.push(listener);
    }

    /// Get all circuit breaker statistics
    pub async fn get_all_stats(&self) -> HashMap<DependencyId, CircuitBreakerStats> {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        let mut stats = HashMap::new();
        for breaker in breakers {
            stats.insert(breaker.dependency().clone(), breaker.get_stats().await);
        }
        stats
    }

    /// Reset all circuit breakers
    pub async fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            DependencyId::new("model-api"),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout_duration: timeout,
                detailed_logging: false,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_blocks() {
        let breaker = breaker(5, Duration::from_secs(60));

        for _ in 0..4 {
            assert!(breaker.allow().await);
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);

        assert!(breaker.allow().await);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.allow().await);

        let stats = breaker.get_stats().await;
        assert_eq!(stats.blocked_requests, 1);
        assert_eq!(stats.circuit_open_count, 1);
        assert_eq!(stats.time_until_half_open_ms, Some(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_then_close() {
        let breaker = breaker(2, Duration::from_millis(100));
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert!(!breaker.allow().await);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(breaker.allow().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        // Only one trial while half-open
        assert!(!breaker.allow().await);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.get_stats().await.failure_count, 0);
        assert!(breaker.allow().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(100));
        breaker.record_failure().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(breaker.allow().await);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.allow().await);
        assert_eq!(breaker.get_stats().await.circuit_open_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure().await;
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(breaker.allow().await);
        assert!(!breaker.allow().await);

        breaker.abandon_trial().await;
        assert!(breaker.allow().await);
    }

    struct CountingListener(AtomicU32);

    #[async_trait::async_trait]
    impl CircuitBreakerListener for CountingListener {
        async fn on_transition(&self, _event: &CircuitBreakerEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_registry_get_or_create_with_overrides() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let id = DependencyId::new("video-platform");
        registry
            .configure(id.clone(), CircuitBreakerConfig::critical_service())
            .await;

        let listener = Arc::new(CountingListener(AtomicU32::new(0)));
        registry.add_listener(listener.clone()).await;

        let first = registry.get_breaker(&id).await;
        let second = registry.get_breaker(&id).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.config().failure_threshold, 3);

        for _ in 0..3 {
            first.record_failure().await;
        }
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        registry.reset_all().await;
        assert_eq!(first.state().await, CircuitState::Closed);
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
        assert!(registry.get(&DependencyId::new("unknown")).await.is_none());
    }
}
