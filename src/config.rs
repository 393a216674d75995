/*!
 * Configuration types for the dispatch engine
 */

use crate::error::DispatchError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-source configuration: rate limits, breaker thresholds, retry parameters
/// and the transport endpoint.
///
/// Immutable after load. The engine owns the loaded configs and hands each
/// worker a shared reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source identifier used for routing
    pub id: String,

    /// Base transport target (URL, host:port, etc.) passed to the transport
    pub endpoint: String,

    /// Sustained request rate admitted to the upstream (tokens/second)
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Token bucket capacity (burst size)
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: f64,

    /// Maximum concurrent in-flight calls to this source
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Seconds to wait before the open circuit admits a probe
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Maximum retry attempts after the initial call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier (exponential backoff)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Apply random jitter to retry delays
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl SourceConfig {
    /// Create a config with defaults for everything but identity
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            requests_per_second: default_requests_per_second(),
            burst_capacity: default_burst_capacity(),
            max_concurrent: default_max_concurrent(),
            max_failures: default_max_failures(),
            cooldown_secs: default_cooldown_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }

    /// Breaker cooldown as a Duration
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Validate rate and threshold values
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.id.is_empty() {
            return Err(DispatchError::Config("source id must not be empty".to_string()));
        }
        if self.requests_per_second <= 0.0 {
            return Err(DispatchError::Config(format!(
                "source '{}': requests_per_second must be > 0",
                self.id
            )));
        }
        if self.burst_capacity < 1.0 {
            return Err(DispatchError::Config(format!(
                "source '{}': burst_capacity must be >= 1",
                self.id
            )));
        }
        if self.max_concurrent == 0 {
            return Err(DispatchError::Config(format!(
                "source '{}': max_concurrent must be > 0",
                self.id
            )));
        }
        if self.max_failures == 0 {
            return Err(DispatchError::Config(format!(
                "source '{}': max_failures must be > 0",
                self.id
            )));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(DispatchError::Config(format!(
                "source '{}': backoff_multiplier must be >= 1",
                self.id
            )));
        }
        Ok(())
    }
}

/// Engine-wide configuration: the source set plus pool and queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// All configured sources
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Global ceiling on in-flight calls across all sources
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Maximum time a submission may wait for a pool slot
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Dispatch queue capacity (drop-oldest beyond this)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum items the background drain pulls per tick
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,

    /// Interval between background drain ticks in milliseconds
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Number of latency samples retained for percentile estimation
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            max_in_flight: default_max_in_flight(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            drain_batch_size: default_drain_batch_size(),
            drain_interval_ms: default_drain_interval_ms(),
            latency_window: default_latency_window(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, DispatchError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self, DispatchError> {
        let config: EngineConfig = toml::from_str(contents)
            .map_err(|e| DispatchError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the engine config and every source config
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_in_flight == 0 {
            return Err(DispatchError::Config("max_in_flight must be > 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(DispatchError::Config("queue_capacity must be > 0".to_string()));
        }
        if self.drain_batch_size == 0 {
            return Err(DispatchError::Config("drain_batch_size must be > 0".to_string()));
        }
        if self.latency_window == 0 {
            return Err(DispatchError::Config("latency_window must be > 0".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.id.as_str()) {
                return Err(DispatchError::Config(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
        }
        Ok(())
    }

    /// Pool slot acquisition timeout as a Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Background drain tick interval as a Duration
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst_capacity() -> f64 {
    20.0
}

fn default_max_concurrent() -> usize {
    8
}

fn default_max_failures() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    64
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_drain_batch_size() -> usize {
    32
}

fn default_drain_interval_ms() -> u64 {
    250
}

fn default_latency_window() -> usize {
    1024
}
