//! Configuration management for the resilience layer
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `RESILIENCE__*` environment variables
//! (`RESILIENCE__MAX_ATTEMPTS=5`, `RESILIENCE__DEPENDENCIES__MODEL-API__FAILURE_THRESHOLD=3`).

pub mod resource_sources;

pub use resource_sources::{ResourceLoader, ResourceSource};

use crate::error::{ResilienceError, Result};
use crate::error_recovery::{
    CircuitBreakerConfig, DependencyId, ErrorClassifier, ExhaustionPolicy, RecoveryPolicy,
};
use crate::monitoring::FrequencyConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "RESILIENCE";

/// Top-level resilience settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    /// Consecutive failures before a breaker opens
    pub failure_threshold: u32,
    /// Breaker cooldown before a trial call
    #[serde(with = "humantime_serde")]
    pub breaker_timeout: Duration,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Backoff ceiling
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Longest rate-limit wait accepted before escalating
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    /// Wait used when a rate limit carries no `Retry-After`
    #[serde(with = "humantime_serde")]
    pub default_rate_limit_wait: Duration,
    /// Overall budget per call; unset means no deadline
    #[serde(default, with = "humantime_serde")]
    pub deadline: Option<Duration>,
    /// Recurrences of one `(kind, operation)` pair that trigger escalation
    pub escalation_threshold: usize,
    #[serde(with = "humantime_serde")]
    pub escalation_window: Duration,
    /// Per-dependency overrides keyed by dependency id
    pub dependencies: HashMap<String, DependencySettings>,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        let breaker = CircuitBreakerConfig::default();
        let policy = RecoveryPolicy::default();
        let frequency = FrequencyConfig::default();
        Self {
            failure_threshold: breaker.failure_threshold,
            breaker_timeout: breaker.timeout_duration,
            max_attempts: policy.max_attempts,
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
            max_wait: policy.max_wait,
            default_rate_limit_wait: Duration::from_secs(60),
            deadline: None,
            escalation_threshold: frequency.threshold,
            escalation_window: frequency.window,
            dependencies: HashMap::new(),
        }
    }
}

/// Overrides for one dependency
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencySettings {
    pub failure_threshold: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
    /// `"process"` or a duration such as `"24h"`
    pub exhaustion: Option<String>,
}

impl ResilienceSettings {
    /// Load defaults, an optional TOML file and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&Self::default())
            .map_err(|e| ResilienceError::config(format!("Invalid default settings: {e}")))?;

        let mut builder = ::config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading resilience settings file");
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ResilienceError::config(format!("Failed to load settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Reject values no dispatcher could run with
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::config("failure_threshold must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(ResilienceError::config("max_attempts must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(ResilienceError::config(
                "base_delay must not exceed max_delay",
            ));
        }
        for (id, dependency) in &self.dependencies {
            if dependency.failure_threshold == Some(0) || dependency.max_attempts == Some(0) {
                return Err(ResilienceError::config(format!(
                    "dependency {id}: thresholds and attempts must be at least 1"
                )));
            }
            dependency.exhaustion_policy()?;
        }
        Ok(())
    }

    /// Overrides for one dependency, matching lowercased environment keys too
    pub fn overrides(&self, dependency: &DependencyId) -> Option<&DependencySettings> {
        // Environment keys arrive lowercased
        self.dependencies
            .get(dependency.as_str())
            .or_else(|| self.dependencies.get(&dependency.as_str().to_lowercase()))
    }

    /// Breaker configuration used for dependencies without overrides
    pub fn default_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            timeout_duration: self.breaker_timeout,
            ..CircuitBreakerConfig::default()
        }
    }

    /// Breaker configuration for one dependency
    pub fn breaker_config(&self, dependency: &DependencyId) -> CircuitBreakerConfig {
        let mut config = self.default_breaker_config();
        if let Some(overrides) = self.overrides(dependency) {
            if let Some(threshold) = overrides.failure_threshold {
                config.failure_threshold = threshold;
            }
            if let Some(timeout) = overrides.timeout {
                config.timeout_duration = timeout;
            }
        }
        config
    }

    /// Recovery policy for calls against one dependency
    pub fn policy_for(&self, dependency: &DependencyId) -> RecoveryPolicy {
        let mut builder = RecoveryPolicy::builder()
            .max_attempts(self.max_attempts)
            .base_delay(self.base_delay)
            .max_delay(self.max_delay)
            .max_wait(self.max_wait)
            .dependency(dependency.clone());
        if let Some(deadline) = self.deadline {
            builder = builder.deadline(deadline);
        }
        if let Some(attempts) = self.overrides(dependency).and_then(|d| d.max_attempts) {
            builder = builder.max_attempts(attempts);
        }
        builder.build()
    }

    /// Disable policy for a dependency's resource pool
    pub fn exhaustion_for(&self, dependency: &DependencyId) -> Result<ExhaustionPolicy> {
        match self.overrides(dependency) {
            Some(overrides) => overrides.exhaustion_policy(),
            None => Ok(ExhaustionPolicy::default()),
        }
    }

    /// Escalation window for the metrics tracker
    pub fn frequency(&self) -> FrequencyConfig {
        FrequencyConfig {
            threshold: self.escalation_threshold,
            window: self.escalation_window,
        }
    }

    /// Classifier with the configured rate-limit default
    pub fn classifier(&self) -> ErrorClassifier {
        ErrorClassifier::new().with_default_rate_limit_wait(self.default_rate_limit_wait)
    }

    /// Dependencies that carry explicit overrides
    pub fn configured_dependencies(&self) -> impl Iterator<Item = DependencyId> + '_ {
        self.dependencies.keys().map(|id| DependencyId::new(id.as_str()))
    }
}

impl DependencySettings {
    /// Parse the `exhaustion` setting
    pub fn exhaustion_policy(&self) -> Result<ExhaustionPolicy> {
        match self.exhaustion.as_deref().map(str::trim) {
            None | Some("process") | Some("") => Ok(ExhaustionPolicy::ProcessLifetime),
            Some(value) => humantime_serde::re::humantime::parse_duration(value)
                .map(ExhaustionPolicy::TimeBoxed)
                .map_err(|e| {
                    ResilienceError::config(format!("Invalid exhaustion value '{value}': {e}"))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_defaults_match_components() {
        let settings = temp_env::with_vars_unset(
            ["RESILIENCE__MAX_ATTEMPTS", "RESILIENCE__FAILURE_THRESHOLD"],
            || ResilienceSettings::from_env().unwrap(),
        );
        assert_eq!(settings, ResilienceSettings::default());
        assert_eq!(settings.failure_threshold, 5);
        assert_eq!(settings.breaker_timeout, Duration::from_secs(60));
        assert_eq!(settings.default_rate_limit_wait, Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn test_file_then_env_layering() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
max_attempts = 4
base_delay = "500ms"

[dependencies.model-api]
failure_threshold = 2
timeout = "10s"
exhaustion = "24h"
"#
        )
        .unwrap();

        let settings = temp_env::with_var("RESILIENCE__MAX_ATTEMPTS", Some("7"), || {
            ResilienceSettings::load(Some(file.path())).unwrap()
        });

        let model_api = DependencyId::new("model-api");
        assert_eq!(settings.max_attempts, 7);
        assert_eq!(settings.base_delay, Duration::from_millis(500));
        assert_eq!(settings.breaker_config(&model_api).failure_threshold, 2);
        assert_eq!(
            settings.breaker_config(&model_api).timeout_duration,
            Duration::from_secs(10)
        );
        assert_eq!(
            settings.exhaustion_for(&model_api).unwrap(),
            ExhaustionPolicy::TimeBoxed(Duration::from_secs(24 * 3600))
        );
        assert_eq!(settings.policy_for(&model_api).max_attempts, 7);
        assert_eq!(
            settings.breaker_config(&DependencyId::new("video-platform")),
            settings.default_breaker_config()
        );
    }

    #[test]
    fn test_invalid_exhaustion_rejected() {
        let mut settings = ResilienceSettings::default();
        settings.dependencies.insert(
            "search".to_string(),
            DependencySettings {
                exhaustion: Some("until tomorrow".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(settings.validate(), Err(ResilienceError::Config(_))));
    }
}
