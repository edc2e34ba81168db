//! Common test utilities

#![allow(dead_code)]

use pipeline_resilience::error_recovery::{MemoryNotifier, NotificationSink};
use pipeline_resilience::{
    CallContext, DependencyId, RecoveryDispatcher, ResilienceSettings, ResourcePool,
};
use rstest::fixture;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Settings with the production defaults
#[fixture]
pub fn settings() -> ResilienceSettings {
    ResilienceSettings::default()
}

/// Dispatcher plus the notifier it escalates to
pub async fn dispatcher_with(
    settings: ResilienceSettings,
    pools: Vec<ResourcePool>,
) -> (Arc<RecoveryDispatcher>, MemoryNotifier) {
    let notifier = MemoryNotifier::new();
    let sink: Arc<dyn NotificationSink> = Arc::new(notifier.clone());

    let mut builder = RecoveryDispatcher::builder()
        .settings(settings)
        .notifier(sink);
    for pool in pools {
        builder = builder.pool(pool);
    }
    let dispatcher = builder.build().await.expect("valid test settings");
    (Arc::new(dispatcher), notifier)
}

/// Pool whose entries are ranked in the given order
pub fn pool(dependency: &str, values: &[&str]) -> ResourcePool {
    ResourcePool::ranked(
        DependencyId::new(dependency),
        "test",
        values.iter().map(|v| v.to_string()),
    )
}

/// One observed invocation of a work function
#[derive(Debug, Clone)]
pub struct Invocation {
    pub attempt: u32,
    pub resource: Option<String>,
    pub at: Instant,
}

/// Shared log of work function invocations
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Invocation>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ctx: &CallContext) {
        self.0.lock().unwrap().push(Invocation {
            attempt: ctx.attempt,
            resource: ctx.resource_value().map(str::to_string),
            at: Instant::now(),
        });
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.0.lock().unwrap().clone()
    }

    /// Gaps between consecutive invocations
    pub fn gaps(&self) -> Vec<std::time::Duration> {
        self.invocations()
            .windows(2)
            .map(|pair| pair[1].at.duration_since(pair[0].at))
            .collect()
    }
}
