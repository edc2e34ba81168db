//! Error recovery for calls against unreliable external dependencies
//!
//! Failures are classified into a small taxonomy, each kind carrying a
//! recovery strategy. The [`RecoveryDispatcher`] applies that strategy using
//! per-dependency circuit breakers and resource pools.

pub mod circuit_breaker;
pub mod classifier;
pub mod dependency;
pub mod dispatcher;
pub mod notification;
pub mod resource_pool;
pub mod retry_policy;

// Re-export commonly used types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerListener,
    CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
pub use classifier::{
    ClassifiedError, ClassifyContext, ErrorClassifier, ErrorKind, KindProfile, PatternRule,
    RecoveryStrategy, Severity,
};
pub use dependency::DependencyId;
pub use dispatcher::{
    with_recovery, CallContext, DispatchResult, RecoveringFn, RecoveryDispatcher,
    RecoveryDispatcherBuilder,
};
pub use notification::{LogNotifier, MemoryNotifier, NotificationSink};
pub use resource_pool::{
    ExhaustionPolicy, PoolStats, ResourceEntry, ResourcePool, ResourcePoolRegistry,
};
pub use retry_policy::{
    BackoffStrategy, JitterConfig, JitterType, RecoveryPolicy, RecoveryPolicyBuilder,
};
