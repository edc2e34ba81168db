//! Recovery dispatcher combining classification, circuit breaking, retries
//! and resource rotation
//!
//! [`RecoveryDispatcher::execute`] wraps one unit of work against an
//! external dependency. Each failed attempt is classified and the kind's
//! recovery strategy decides what happens next: retry at once, back off,
//! wait out a rate limit, rotate to the next pooled resource, or give up.
//! The caller receives either the work's value or exactly one terminal
//! [`ClassifiedError`].

use crate::config::ResilienceSettings;
use crate::error::{ErrorReporter, Result};
use crate::error_recovery::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerListener, CircuitBreakerRegistry,
    CircuitState, ClassifiedError, ClassifyContext, DependencyId, ErrorClassifier, ErrorKind, LogNotifier,
    NotificationSink, RecoveryPolicy, RecoveryStrategy, ResourceEntry, ResourcePool,
    ResourcePoolRegistry,
};
use crate::monitoring::MetricsTracker;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of a dispatched call
pub type DispatchResult<T> = std::result::Result<T, ClassifiedError>;

/// Per-call context handed to the work function on every attempt
#[derive(Debug, Clone, Serialize)]
pub struct CallContext {
    /// Caller-supplied inputs
    pub values: HashMap<String, serde_json::Value>,
    /// Resource currently selected from the dependency's pool
    pub resource: Option<ResourceEntry>,
    /// 1-based attempt number
    pub attempt: u32,
    pub correlation_id: Uuid,
    /// Dedupe token for work with side effects, stable across retries
    pub idempotency_key: Option<String>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            resource: None,
            attempt: 0,
            correlation_id: Uuid::new_v4(),
            idempotency_key: None,
        }
    }

    pub fn with_value<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_idempotency_key<S: Into<String>>(mut self, key: S) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Pre-select a resource, skipping the dispatcher's initial rotation
    pub fn with_resource(mut self, resource: ResourceEntry) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Value of the selected resource, if any
    pub fn resource_value(&self) -> Option<&str> {
        self.resource.as_ref().map(|r| r.value.as_str())
    }
}

/// Why a call stopped before its work completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Deadline,
}

impl Interrupt {
    fn into_error(self, operation: &str) -> ClassifiedError {
        let (reason, message) = match self {
            Self::Cancelled => ("cancelled", format!("{operation} cancelled")),
            Self::Deadline => ("deadline", format!("{operation} exceeded its deadline")),
        };
        ClassifiedError::new(ErrorKind::Timeout, message).with_detail("reason", reason)
    }
}

/// Race a future against cancellation and an optional deadline
async fn guarded<F: Future>(
    future: F,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> std::result::Result<F::Output, Interrupt> {
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = expiry => Err(Interrupt::Deadline),
        output = future => Ok(output),
    }
}

/// What the loop does after a failed attempt
enum Next {
    Continue,
    Escalate(ClassifiedError),
}

/// Orchestrates recovery for calls against external dependencies
///
/// Construct one per process or run and share it behind an `Arc`.
pub struct RecoveryDispatcher {
    breakers: Arc<CircuitBreakerRegistry>,
    pools: Arc<ResourcePoolRegistry>,
    metrics: Arc<MetricsTracker>,
    classifier: ErrorClassifier,
    notifier: Arc<dyn NotificationSink>,
    settings: ResilienceSettings,
}

impl RecoveryDispatcher {
    pub fn builder() -> RecoveryDispatcherBuilder {
        RecoveryDispatcherBuilder::new()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn pools(&self) -> &Arc<ResourcePoolRegistry> {
        &self.pools
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    /// Policy for a dependency derived from the dispatcher's settings
    pub fn policy_for(&self, dependency: &DependencyId) -> RecoveryPolicy {
        self.settings.policy_for(dependency)
    }

    /// Register (or replace) a dependency's resource pool
    pub async fn register_pool(&self, pool: ResourcePool) {
        self.pools.register(pool).await;
    }

    /// Run `work` under `policy` until it succeeds or recovery is exhausted
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        policy: &RecoveryPolicy,
        context: CallContext,
        work: F,
    ) -> DispatchResult<T>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_cancellation(operation, policy, context, CancellationToken::new(), work)
            .await
    }

    /// Like [`execute`](Self::execute), aborting with a `TIMEOUT` error once
    /// `cancel` fires or the policy deadline passes
    pub async fn execute_with_cancellation<T, F, Fut>(
        &self,
        operation: &str,
        policy: &RecoveryPolicy,
        mut context: CallContext,
        cancel: CancellationToken,
        mut work: F,
    ) -> DispatchResult<T>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let deadline = policy.deadline.map(|budget| started + budget);
        let dependency = policy.dependency_id.clone();
        let mut attempts_made = 0u32;

        let breaker = match &dependency {
            Some(id) if policy.circuit_breaking => Some(self.breakers.get_breaker(id).await),
            Some(id) => self.breakers.get(id).await,
            None => None,
        };

        if let Some(id) = &dependency {
            if context.resource.is_none() && self.pools.has_pool(id).await {
                match self.pools.rotate(id).await {
                    Ok(entry) => {
                        debug!(
                            operation,
                            dependency = %id,
                            rank = entry.priority_rank,
                            source = %entry.source_label,
                            "Acquired initial resource"
                        );
                        context.resource = Some(entry);
                    }
                    Err(exhausted) => {
                        return Err(self
                            .terminal(operation, exhausted, attempts_made, started, &dependency)
                            .await);
                    }
                }
            }
        }

        let mut last_error = None;
        for attempt in 1..=policy.max_attempts {
            if cancel.is_cancelled() {
                last_error = Some(Interrupt::Cancelled.into_error(operation));
                break;
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                last_error = Some(Interrupt::Deadline.into_error(operation));
                break;
            }

            if let Some(breaker) = &breaker {
                if !breaker.allow().await {
                    let rejected = self.circuit_open(operation, breaker, attempt);
                    self.metrics.record(operation, Duration::ZERO, false).await;
                    self.metrics.record_error(operation, rejected.kind).await;
                    last_error = Some(rejected);
                    break;
                }
            }

            context.attempt = attempt;
            attempts_made = attempt;
            if policy.detailed_logging {
                debug!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    correlation_id = %context.correlation_id,
                    "Invoking work function"
                );
            }

            let call_started = Instant::now();
            let outcome = guarded(work(context.clone()), &cancel, deadline).await;
            let elapsed = call_started.elapsed();

            let raw = match outcome {
                Ok(Ok(value)) => {
                    if let Some(breaker) = &breaker {
                        if policy.circuit_breaking {
                            breaker.record_success().await;
                        } else {
                            breaker.abandon_trial().await;
                        }
                    }
                    self.metrics.record(operation, elapsed, true).await;
                    if attempt > 1 {
                        info!(operation, attempt, "Operation recovered");
                    }
                    return Ok(value);
                }
                Ok(Err(raw)) => raw,
                Err(interrupt) => {
                    if let Some(breaker) = &breaker {
                        breaker.abandon_trial().await;
                    }
                    let error = interrupt.into_error(operation);
                    self.metrics.record(operation, elapsed, false).await;
                    self.metrics.record_error(operation, error.kind).await;
                    last_error = Some(error);
                    break;
                }
            };

            let mut ctx = ClassifyContext::new(operation).with_attempt(attempt);
            if let Some(id) = &dependency {
                ctx = ctx.with_dependency(id.clone());
            }
            let classified = self.classifier.classify(&raw, &ctx);

            self.metrics.record(operation, elapsed, false).await;
            self.metrics.record_error(operation, classified.kind).await;
            let mut tripped = false;
            if let Some(breaker) = &breaker {
                if policy.circuit_breaking {
                    breaker.record_failure().await;
                    tripped = breaker.state().await == CircuitState::Open;
                } else {
                    breaker.abandon_trial().await;
                }
            }

            warn!(
                operation,
                attempt,
                error_kind = classified.kind.as_str(),
                strategy = classified.strategy.as_str(),
                "Attempt failed: {}",
                classified.message
            );

            if tripped {
                if let Some(breaker) = &breaker {
                    last_error = Some(
                        self.circuit_open(operation, breaker, attempt)
                            .with_detail("last_error_kind", classified.kind.as_str())
                            .with_detail("last_error", classified.message.clone()),
                    );
                }
                break;
            }

            let last_attempt = attempt == policy.max_attempts;
            match self
                .recover(operation, policy, &mut context, &classified, attempt, last_attempt, &cancel, deadline)
                .await
            {
                Next::Continue if !last_attempt => {
                    self.metrics.record_strategy(operation, classified.strategy).await;
                    last_error = Some(classified);
                }
                Next::Continue => {
                    last_error = Some(classified);
                }
                Next::Escalate(error) => {
                    last_error = Some(error);
                    break;
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            ClassifiedError::new(
                ErrorKind::Configuration,
                format!("{operation}: recovery policy allows no attempts"),
            )
        });
        Err(self
            .terminal(operation, error, attempts_made, started, &dependency)
            .await)
    }

    /// Carry out the classified strategy ahead of the next attempt
    #[allow(clippy::too_many_arguments)]
    async fn recover(
        &self,
        operation: &str,
        policy: &RecoveryPolicy,
        context: &mut CallContext,
        classified: &ClassifiedError,
        attempt: u32,
        last_attempt: bool,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Next {
        let strategy = if classified.recoverable {
            classified.strategy
        } else {
            RecoveryStrategy::None
        };

        match strategy {
            RecoveryStrategy::Retry => Next::Continue,
            RecoveryStrategy::RetryBackoff => {
                if last_attempt {
                    return Next::Continue;
                }
                let delay = policy.backoff_delay(attempt);
                debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                self.pause(operation, delay, cancel, deadline).await
            }
            RecoveryStrategy::WaitRetry => {
                let wait = classified
                    .retry_after()
                    .unwrap_or(self.settings.default_rate_limit_wait);
                if wait > policy.max_wait {
                    warn!(
                        operation,
                        wait_secs = wait.as_secs(),
                        max_wait_secs = policy.max_wait.as_secs(),
                        "Requested wait exceeds limit, escalating"
                    );
                    return Next::Escalate(
                        classified
                            .clone()
                            .with_detail("max_wait", policy.max_wait.as_secs()),
                    );
                }
                if last_attempt {
                    return Next::Continue;
                }
                info!(operation, wait_secs = wait.as_secs(), "Waiting out rate limit");
                self.pause(operation, wait, cancel, deadline).await
            }
            RecoveryStrategy::Fallback => {
                self.fall_back(operation, policy, context, classified, last_attempt)
                    .await
            }
            RecoveryStrategy::None | RecoveryStrategy::CircuitBreak => {
                Next::Escalate(classified.clone())
            }
        }
    }

    /// Disable the failed resource and rotate to the next one
    async fn fall_back(
        &self,
        operation: &str,
        policy: &RecoveryPolicy,
        context: &mut CallContext,
        classified: &ClassifiedError,
        last_attempt: bool,
    ) -> Next {
        let Some(dependency) = &policy.dependency_id else {
            return Next::Escalate(classified.clone().with_detail("fallback", "no dependency"));
        };
        if !self.pools.has_pool(dependency).await {
            return Next::Escalate(classified.clone().with_detail("fallback", "no resource pool"));
        }

        if let Some(failed) = &context.resource {
            self.pools
                .mark_disabled(dependency, failed.priority_rank, classified.retry_after())
                .await;
        }
        if last_attempt {
            return Next::Continue;
        }

        match self.pools.rotate(dependency).await {
            Ok(entry) => {
                warn!(
                    operation,
                    dependency = %dependency,
                    rank = entry.priority_rank,
                    source = %entry.source_label,
                    resource = %entry.masked_value(),
                    "Falling back to next resource"
                );
                context.resource = Some(entry);
                Next::Continue
            }
            Err(exhausted) => Next::Escalate(
                exhausted
                    .with_detail("last_error_kind", classified.kind.as_str())
                    .with_detail("last_error", classified.message.clone()),
            ),
        }
    }

    /// Sleep without holding any shared lock, aborting on cancel or deadline
    async fn pause(
        &self,
        operation: &str,
        duration: Duration,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Next {
        match guarded(tokio::time::sleep(duration), cancel, deadline).await {
            Ok(()) => Next::Continue,
            Err(interrupt) => {
                debug!(operation, ?interrupt, "Sleep interrupted");
                Next::Escalate(interrupt.into_error(operation))
            }
        }
    }

    fn circuit_open(
        &self,
        operation: &str,
        breaker: &CircuitBreaker,
        attempt: u32,
    ) -> ClassifiedError {
        warn!(
            operation,
            dependency = %breaker.dependency(),
            "Circuit open, call rejected without invoking work"
        );
        ClassifiedError::new(
            ErrorKind::CircuitOpen,
            format!("circuit open for {}", breaker.dependency()),
        )
        .with_detail("operation", operation)
        .with_detail("attempt", attempt)
    }

    /// Annotate, log and (when warranted) escalate the terminal error
    async fn terminal(
        &self,
        operation: &str,
        mut error: ClassifiedError,
        attempts_made: u32,
        started: Instant,
        dependency: &Option<DependencyId>,
    ) -> ClassifiedError {
        error.set_detail("attempts_made", attempts_made);
        error.set_detail("elapsed_seconds", started.elapsed().as_secs_f64());
        if let Some(id) = dependency {
            error.set_detail("dependency", id.as_str());
        }

        ErrorReporter::log_error(&error, operation);
        let frequent = self.metrics.record_failed_call(operation, error.kind).await;
        if error.is_critical() || frequent {
            self.notifier.notify(&error, operation).await;
        }
        error
    }
}

/// Builder wiring the dispatcher's registries from settings
pub struct RecoveryDispatcherBuilder {
    settings: ResilienceSettings,
    classifier: Option<ErrorClassifier>,
    notifier: Option<Arc<dyn NotificationSink>>,
    metrics: Option<Arc<MetricsTracker>>,
    pools: Vec<ResourcePool>,
    breaker_overrides: Vec<(DependencyId, CircuitBreakerConfig)>,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
}

impl Default for RecoveryDispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryDispatcherBuilder {
    pub fn new() -> Self {
        Self {
            settings: ResilienceSettings::default(),
            classifier: None,
            notifier: None,
            metrics: None,
            pools: Vec::new(),
            breaker_overrides: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn settings(mut self, settings: ResilienceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the classifier derived from settings
    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Share an existing tracker instead of creating one
    pub fn metrics(mut self, metrics: Arc<MetricsTracker>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pool(mut self, pool: ResourcePool) -> Self {
        self.pools.push(pool);
        self
    }

    /// Breaker configuration for one dependency, over any settings override
    pub fn breaker<D: Into<DependencyId>>(mut self, dependency: D, config: CircuitBreakerConfig) -> Self {
        self.breaker_overrides.push((dependency.into(), config));
        self
    }

    pub fn listener(mut self, listener: Arc<dyn CircuitBreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub async fn build(self) -> Result<RecoveryDispatcher> {
        self.settings.validate()?;

        let breakers = CircuitBreakerRegistry::new(self.settings.default_breaker_config());
        for dependency in self.settings.configured_dependencies() {
            let config = self.settings.breaker_config(&dependency);
            breakers.configure(dependency, config).await;
        }
        for (dependency, config) in self.breaker_overrides {
            breakers.configure(dependency, config).await;
        }
        for listener in self.listeners {
            breakers.add_listener(listener).await;
        }

        let pools = ResourcePoolRegistry::new();
        for mut pool in self.pools {
            // Settings only override pools whose dependency is configured there
            if self.settings.overrides(pool.dependency()).is_some() {
                let policy = self.settings.exhaustion_for(pool.dependency())?;
                pool = pool.with_policy(policy);
            }
            pools.register(pool).await;
        }

        let classifier = self
            .classifier
            .unwrap_or_else(|| self.settings.classifier());
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsTracker::new(self.settings.frequency())));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        info!(
            failure_threshold = self.settings.failure_threshold,
            max_attempts = self.settings.max_attempts,
            "Recovery dispatcher ready"
        );

        Ok(RecoveryDispatcher {
            breakers: Arc::new(breakers),
            pools: Arc::new(pools),
            metrics,
            classifier,
            notifier,
            settings: self.settings,
        })
    }
}

/// Work function bound to a dispatcher, operation name and policy
pub struct RecoveringFn<F> {
    dispatcher: Arc<RecoveryDispatcher>,
    operation: String,
    policy: RecoveryPolicy,
    work: F,
}

/// Wrap `work` so every call goes through the dispatcher
pub fn with_recovery<F, S>(
    dispatcher: Arc<RecoveryDispatcher>,
    operation: S,
    policy: RecoveryPolicy,
    work: F,
) -> RecoveringFn<F>
where
    S: Into<String>,
{
    RecoveringFn {
        dispatcher,
        operation: operation.into(),
        policy,
        work,
    }
}

impl<F> RecoveringFn<F> {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub async fn call<T, Fut>(&self, context: CallContext) -> DispatchResult<T>
    where
        F: Fn(CallContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.dispatcher
            .execute(&self.operation, &self.policy, context, &self.work)
            .await
    }

    pub async fn call_with_cancellation<T, Fut>(
        &self,
        context: CallContext,
        cancel: CancellationToken,
    ) -> DispatchResult<T>
    where
        F: Fn(CallContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.dispatcher
            .execute_with_cancellation(&self.operation, &self.policy, context, cancel, &self.work)
            .await
    }
}
