//! Resilience and fallback orchestration for content pipeline dependencies
//!
//! Every call to an unreliable external dependency (model APIs, video
//! platform APIs, credential lookups, candidate selection) goes through a
//! [`RecoveryDispatcher`], which decides for each failure whether to retry,
//! wait, rotate to an alternate resource, or give up.
//!
//! # Features
//!
//! - Failure taxonomy with a fixed strategy per kind
//! - Per-dependency circuit breakers with half-open trials
//! - Priority-ordered resource pools loaded from layered sources
//! - Per-operation metrics with error frequency escalation
//! - Deadlines and cancellation for every retry loop
//!
//! ```no_run
//! use pipeline_resilience::{CallContext, RecoveryDispatcher, RecoveryPolicy, ResilienceError};
//!
//! # async fn run() -> pipeline_resilience::Result<()> {
//! let dispatcher = RecoveryDispatcher::builder().build().await?;
//! let policy = RecoveryPolicy::builder().dependency("model-api").build();
//!
//! let script = dispatcher
//!     .execute("generate_script", &policy, CallContext::new(), |ctx| async move {
//!         let key = ctx.resource_value().unwrap_or_default().to_string();
//!         if key.is_empty() {
//!             return Err(ResilienceError::credentials("no model API key"));
//!         }
//!         Ok(format!("script generated with {key}"))
//!     })
//!     .await;
//! # let _ = script;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod logging;
pub mod monitoring;

// Re-export main types for convenience
pub use config::{ResilienceSettings, ResourceLoader, ResourceSource};
pub use error::{ErrorReporter, ResilienceError, Result};
pub use error_recovery::{
    with_recovery, CallContext, CircuitBreakerRegistry, CircuitState, ClassifiedError,
    DependencyId, ErrorClassifier, ErrorKind, ExhaustionPolicy, RecoveryDispatcher,
    RecoveryPolicy, RecoveryStrategy, ResourceEntry, ResourcePool, Severity,
};
pub use monitoring::MetricsTracker;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
