//! Recovery policy: attempt budget, backoff schedule and deadline
//!
//! The dispatcher consults a [`RecoveryPolicy`] for how many attempts a call
//! gets, how long `RETRY_BACKOFF` waits between them and which dependency
//! (breaker and resource pool) the call belongs to.

use crate::error_recovery::DependencyId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategies for retry delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff (delay increases linearly)
    Linear {
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    /// Exponential backoff: `base_delay * multiplier^(attempt-1)`
    Exponential { multiplier: f64 },
    /// Fibonacci backoff
    Fibonacci,
}

/// Jitter configuration for retry delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterConfig {
    pub enabled: bool,
    pub jitter_type: JitterType,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jitter_type: JitterType::Equal,
            jitter_factor: 0.5,
        }
    }
}

/// Types of jitter strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterType {
    /// delay = random(0, delay * factor)
    Full,
    /// delay = delay/2 + random(0, delay/2 * factor)
    Equal,
}

/// Per-call recovery policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Upper bound on work function invocations per `execute`
    pub max_attempts: u32,
    /// First backoff delay
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Ceiling for any backoff delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Longest `WAIT_RETRY` sleep accepted; longer waits escalate instead
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    pub backoff: BackoffStrategy,
    pub jitter: JitterConfig,
    /// Dependency the call belongs to (breaker and pool key)
    pub dependency_id: Option<DependencyId>,
    /// Whether failures count towards the dependency's breaker
    pub circuit_breaking: bool,
    /// Overall time budget for the call including all retries and waits
    #[serde(default, with = "humantime_serde")]
    pub deadline: Option<Duration>,
    pub detailed_logging: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_wait: Duration::from_secs(900),
            backoff: BackoffStrategy::Exponential { multiplier: 2.0 },
            jitter: JitterConfig::default(),
            dependency_id: None,
            circuit_breaking: true,
            deadline: None,
            detailed_logging: true,
        }
    }
}

impl RecoveryPolicy {
    /// Start building a policy from the defaults
    pub fn builder() -> RecoveryPolicyBuilder {
        RecoveryPolicyBuilder::new()
    }

    /// Policy for interactive, latency-sensitive calls
    pub fn critical() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_wait: Duration::from_secs(30),
            backoff: BackoffStrategy::Linear {
                increment: Duration::from_millis(250),
            },
            jitter: JitterConfig {
                enabled: true,
                jitter_type: JitterType::Full,
                jitter_factor: 0.3,
            },
            ..Self::default()
        }
    }

    /// Policy for background pipeline stages that may wait out quotas
    pub fn background() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(600),
            max_wait: Duration::from_secs(3600),
            backoff: BackoffStrategy::Exponential { multiplier: 3.0 },
            detailed_logging: false,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = match &self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear { increment } => {
                self.base_delay + increment.saturating_mul(attempt - 1)
            }
            BackoffStrategy::Exponential { multiplier } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
                    .unwrap_or(self.max_delay)
            }
            BackoffStrategy::Fibonacci => self.base_delay.saturating_mul(fibonacci(attempt)),
        };

        let capped = base.min(self.max_delay);
        if self.jitter.enabled {
            self.apply_jitter(capped)
        } else {
            capped
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let delay_secs = delay.as_secs_f64();
        let factor = self.jitter.jitter_factor.clamp(0.0, 1.0);

        let jittered = match self.jitter.jitter_type {
            JitterType::Full => rng.gen_range(0.0..=delay_secs * factor),
            JitterType::Equal => {
                let half = delay_secs / 2.0;
                half + rng.gen_range(0.0..=half * factor)
            }
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Calculate fibonacci number
fn fibonacci(n: u32) -> u32 {
    match n {
        0 => 0,
        1 => 1,
        _ => {
            let mut a: u32 = 0;
            let mut b: u32 = 1;
            for _ in 2..=n {
                let next = a.saturating_add(b);
                a = b;
                b = next;
            }
            b
        }
    }
}

/// Fluent builder for [`RecoveryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RecoveryPolicyBuilder {
    policy: RecoveryPolicy,
}

impl RecoveryPolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.policy.max_wait = wait;
        self
    }

    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.policy.backoff = strategy;
        self
    }

    pub fn with_jitter(mut self, jitter_type: JitterType, factor: f64) -> Self {
        self.policy.jitter = JitterConfig {
            enabled: true,
            jitter_type,
            jitter_factor: factor,
        };
        self
    }

    pub fn dependency<D: Into<DependencyId>>(mut self, dependency: D) -> Self {
        self.policy.dependency_id = Some(dependency.into());
        self
    }

    pub fn circuit_breaking(mut self, enabled: bool) -> Self {
        self.policy.circuit_breaking = enabled;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.policy.deadline = Some(deadline);
        self
    }

    pub fn build(self) -> RecoveryPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = RecoveryPolicy::builder()
            .base_delay(Duration::from_secs(1))
            .build();

        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_capped_at_ceiling() {
        let policy = RecoveryPolicy::builder()
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(25))
            .build();

        assert_eq!(policy.backoff_delay(2), Duration::from_secs(20));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(25));
        assert_eq!(policy.backoff_delay(60), Duration::from_secs(25));
    }

    #[test]
    fn test_fibonacci_backoff() {
        let policy = RecoveryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .backoff(BackoffStrategy::Fibonacci)
            .build();

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_below_capped_delay() {
        let policy = RecoveryPolicy::builder()
            .base_delay(Duration::from_secs(4))
            .with_jitter(JitterType::Equal, 1.0)
            .build();

        for _ in 0..50 {
            let delay = policy.backoff_delay(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(4));
        }
    }

    #[test]
    fn test_policy_deserializes_humantime() {
        let policy: RecoveryPolicy = serde_json::from_value(serde_json::json!({
            "max_attempts": 4,
            "base_delay": "500ms",
            "max_delay": "1m",
            "max_wait": "10m",
            "backoff": {"type": "linear", "increment": "250ms"},
            "jitter": {"enabled": false, "jitter_type": "full", "jitter_factor": 0.0},
            "dependency_id": "model-api",
            "circuit_breaking": true,
            "detailed_logging": false
        }))
        .unwrap();

        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.deadline, None);
        assert_eq!(policy.dependency_id, Some(DependencyId::new("model-api")));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(1));
    }
}
