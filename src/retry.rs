//! Retry policy: capped exponential backoff with jitter
//!
//! The policy is a pure delay calculator. It never invokes the operation
//! itself. The execution loop lives in the worker, which consults
//! [`RetryPolicy::should_retry`] and sleeps [`RetryPolicy::next_delay`]
//! between attempts. Jitter spreads concurrent retries to avoid synchronized
//! retry storms against a recovering upstream.

use crate::config::SourceConfig;
use crate::error::DispatchError;
use rand::Rng;
use std::time::Duration;

/// Jitter spread applied to computed delays (±25%)
const JITTER_FACTOR: f64 = 0.25;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the initial call
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound on any computed delay
    pub max_delay: Duration,

    /// Multiplier applied per attempt (exponential backoff)
    pub multiplier: f64,

    /// Perturb delays by ±25% uniform jitter
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Build a policy from a source's retry parameters
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Policy for fast retries against rate-limited upstreams
    pub fn fast() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Policy for flaky network paths
    pub fn network() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// Calculate the delay before retrying attempt number `attempt`
    /// (0-based: attempt 0 is the delay after the first failure).
    ///
    /// The result is always within `[0, max_delay]`, jitter included.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63);
        let base_ms = self.initial_delay.as_secs_f64() * 1000.0 * self.multiplier.powi(exponent as i32);
        let capped = Duration::from_millis(base_ms as u64).min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let factor = rand::rng().random_range(1.0 - JITTER_FACTOR..=1.0 + JITTER_FACTOR);
        Duration::from_secs_f64(capped.as_secs_f64() * factor).min(self.max_delay)
    }

    /// Whether a failed attempt should be retried.
    ///
    /// `attempt` is 0-based; retries stop once `max_retries` have been spent
    /// or the error is not transient.
    pub fn should_retry(&self, error: &DispatchError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_retries
    }
}
