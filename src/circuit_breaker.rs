//! Circuit breaker: per-source failure isolation
//!
//! The breaker prevents cascading failures by failing fast once a source is
//! known to be unhealthy. It has three states:
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls fail immediately with `CircuitOpen`, no upstream call made
//! - HalfOpen: exactly one probe call is permitted; its outcome alone decides
//!   the next transition
//!
//! The Open → HalfOpen transition is lazy: it happens when the next caller
//! observes that the cooldown has elapsed, not on a timer.
//!
//! # Example
//! ```no_run
//! use quasar::{CircuitBreaker, CircuitBreakerConfig, DispatchError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), DispatchError> {
//!     let breaker = CircuitBreaker::new("nasdaq", CircuitBreakerConfig::default());
//!
//!     let quote = breaker.execute(|| async {
//!         // upstream call here
//!         Ok::<_, DispatchError>(42)
//!     }).await?;
//!
//!     println!("quote: {}", quote);
//!     Ok(())
//! }
//! ```

use crate::config::SourceConfig;
use crate::error::DispatchError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately until `next_probe`
    Open { next_probe: Instant },
    /// Circuit is half-open, a single probe is testing recovery
    HalfOpen,
}

impl CircuitState {
    /// Snake-case label for metrics snapshots
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub max_failures: u32,
    /// Duration the open circuit waits before admitting a probe
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Build breaker config from a source's thresholds
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            max_failures: config.max_failures,
            cooldown: config.cooldown(),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    probe_in_flight: bool,
    generation: u64,
}

enum Admission {
    Allowed { generation: u64 },
    Rejected,
}

/// Per-source circuit breaker
///
/// Every execution increments the request counter and exactly one of the
/// success/failure counters, including short-circuited calls, so rejected
/// traffic remains observable.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<BreakerInner>>,
    requests: Arc<AtomicU64>,
    successes: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for a named source
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_in_flight: false,
                generation: 0,
            })),
            requests: Arc::new(AtomicU64::new(0)),
            successes: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Execute an operation under circuit breaker protection.
    ///
    /// Returns `DispatchError::CircuitOpen` without invoking `op` when the
    /// circuit is open or another probe is already in flight.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, DispatchError>>,
    {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let generation = {
            let mut inner = self.inner.lock().await;
            match self.admit(&mut inner) {
                Admission::Allowed { generation } => generation,
                Admission::Rejected => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(DispatchError::CircuitOpen);
                }
            }
        };

        let result = op().await;

        let mut inner = self.inner.lock().await;
        match &result {
            Ok(_) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                if inner.generation == generation {
                    self.on_success(&mut inner);
                } else {
                    debug!(source = %self.name, "discarding stale probe success");
                }
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if inner.generation == generation {
                    if e.should_trip_breaker() {
                        self.on_failure(&mut inner);
                    } else if inner.state == CircuitState::HalfOpen {
                        // A locally-rejected probe says nothing about upstream
                        // health; let another probe run.
                        inner.probe_in_flight = false;
                    }
                }
            }
        }

        result
    }

    /// Get the current state of the circuit breaker
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Get the current consecutive failure count
    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.consecutive_failures
    }

    /// Reset the breaker to closed, invalidating any in-flight probe.
    ///
    /// The generation bump guarantees a slow probe admitted before the reset
    /// cannot transition the fresh breaker when it eventually completes.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        inner.generation += 1;
        info!(source = %self.name, generation = inner.generation, "circuit breaker reset");
    }

    /// Snapshot of breaker counters and state
    pub async fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().await;
        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            generation: inner.generation,
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn admit(&self, inner: &mut BreakerInner) -> Admission {
        match inner.state {
            CircuitState::Closed => Admission::Allowed {
                generation: inner.generation,
            },
            CircuitState::Open { next_probe } => {
                if Instant::now() >= next_probe {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(source = %self.name, "circuit half-open, admitting probe");
                    Admission::Allowed {
                        generation: inner.generation,
                    }
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Allowed {
                        generation: inner.generation,
                    }
                }
            }
        }
    }

    fn on_success(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                info!(source = %self.name, "probe succeeded, circuit closed");
            }
            CircuitState::Open { .. } => {
                // A call admitted while closed finished after the circuit
                // opened; the upstream answered, so close again.
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
            }
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.max_failures {
                    inner.state = CircuitState::Open {
                        next_probe: Instant::now() + self.config.cooldown,
                    };
                    inner.consecutive_failures = 0;
                    warn!(
                        source = %self.name,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open {
                    next_probe: Instant::now() + self.config.cooldown,
                };
                inner.probe_in_flight = false;
                warn!(source = %self.name, "probe failed, circuit re-opened");
            }
            CircuitState::Open { .. } => {}
        }
    }
}

/// Snapshot of circuit breaker state and counters
#[derive(Debug, Clone)]
pub struct BreakerStats {
    /// Current circuit state
    pub state: CircuitState,
    /// Consecutive failures recorded in the closed state
    pub consecutive_failures: u32,
    /// Reset generation
    pub generation: u64,
    /// Total executions, including short-circuited calls
    pub requests: u64,
    /// Total successful executions
    pub successes: u64,
    /// Total failed executions, including short-circuited calls
    pub failures: u64,
}
