//! Call metrics for dispatched operations

pub mod metrics;

pub use metrics::{
    ErrorFrequency, FrequencyConfig, MetricsSummary, MetricsTracker, OperationExport,
    OperationMetrics,
};
