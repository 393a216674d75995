//! Source worker: one source's admission, isolation and retry pipeline
//!
//! A [`SourceWorker`] binds one token bucket, one circuit breaker and one
//! retry policy to one source's transport client. `fetch` is total: every
//! request produces exactly one [`FetchResult`], and no fault escapes the
//! worker. Failures from one source can never touch another source's state;
//! the worker is the isolation boundary.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::SourceConfig;
use crate::error::DispatchError;
use crate::retry::RetryPolicy;
use crate::token_bucket::TokenBucket;
use crate::transport::SourceTransport;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

/// A single fetch request, created per call and destroyed after result
/// delivery
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Target source identifier
    pub source_id: String,
    /// Opaque parameter bag forwarded to the transport
    pub params: Value,
    /// Absolute deadline; the request is never retried past it
    pub deadline: Option<Instant>,
}

impl FetchRequest {
    /// Create a request with no deadline
    pub fn new(source_id: impl Into<String>, params: Value) -> Self {
        Self {
            source_id: source_id.into(),
            params,
            deadline: None,
        }
    }

    /// Set an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Whether the deadline has already passed
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Outcome of one fetch request
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Source the request was routed to
    pub source_id: String,
    /// Whether the fetch produced a payload
    pub success: bool,
    /// Normalized payload on success
    pub payload: Option<Value>,
    /// Error classification on failure
    pub error: Option<DispatchError>,
    /// Wall-clock time from submission to completion
    pub latency: Duration,
    /// Upstream attempts made (0 when rejected before any call)
    pub attempts: u32,
}

impl FetchResult {
    /// Build a successful result
    pub fn ok(source_id: impl Into<String>, payload: Value, latency: Duration, attempts: u32) -> Self {
        Self {
            source_id: source_id.into(),
            success: true,
            payload: Some(payload),
            error: None,
            latency,
            attempts,
        }
    }

    /// Build a failed result
    pub fn failed(
        source_id: impl Into<String>,
        error: DispatchError,
        latency: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            success: false,
            payload: None,
            error: Some(error),
            latency,
            attempts,
        }
    }

    /// Whether the request was refused by local admission control
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.error, Some(DispatchError::RateLimited(_)))
    }
}

/// One upstream source's fetch pipeline
pub struct SourceWorker {
    config: Arc<SourceConfig>,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    limit: Arc<Semaphore>,
    transport: Arc<dyn SourceTransport>,
}

impl SourceWorker {
    /// Build a worker from a source config and its transport client
    pub fn new(config: Arc<SourceConfig>, transport: Arc<dyn SourceTransport>) -> Self {
        Self {
            bucket: TokenBucket::new(config.burst_capacity, config.requests_per_second),
            breaker: CircuitBreaker::new(config.id.clone(), CircuitBreakerConfig::from_config(&config)),
            retry: RetryPolicy::from_config(&config),
            limit: Arc::new(Semaphore::new(config.max_concurrent)),
            transport,
            config,
        }
    }

    /// The source this worker serves
    pub fn source_id(&self) -> &str {
        &self.config.id
    }

    /// The worker's admission bucket (for metrics snapshots)
    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// The worker's circuit breaker (for metrics snapshots and operator reset)
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetch from the upstream source.
    ///
    /// Admission order: deadline check, token bucket, per-source concurrency
    /// gate, then the retry loop around the breaker-wrapped transport call.
    /// A token-bucket refusal is returned immediately without consuming any
    /// retry budget; callers re-submit or defer.
    pub async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        let started = Instant::now();

        if request.expired() {
            return FetchResult::failed(&self.config.id, DispatchError::Cancelled, started.elapsed(), 0);
        }

        if !self.bucket.try_consume(1.0) {
            debug!(source = %self.config.id, "token bucket exhausted, refusing request");
            return FetchResult::failed(
                &self.config.id,
                DispatchError::RateLimited(self.config.id.clone()),
                started.elapsed(),
                0,
            );
        }

        let _permit = match self.acquire_slot(request.deadline).await {
            Ok(permit) => permit,
            Err(err) => {
                return FetchResult::failed(&self.config.id, err, started.elapsed(), 0);
            }
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;

            let outcome = self
                .breaker
                .execute(|| self.transport.call(&request.params, request.deadline))
                .await;

            match outcome {
                Ok(payload) => {
                    return FetchResult::ok(&self.config.id, payload, started.elapsed(), attempts);
                }
                Err(err) => {
                    let attempt_index = attempts - 1;
                    if !self.retry.should_retry(&err, attempt_index) {
                        if err.is_transient() {
                            warn!(
                                source = %self.config.id,
                                attempts,
                                error = %err,
                                "retries exhausted"
                            );
                        }
                        return FetchResult::failed(&self.config.id, err, started.elapsed(), attempts);
                    }

                    let delay = self.retry.next_delay(attempt_index);

                    // Never sleep past the deadline; an expired request is
                    // not retried.
                    if let Some(deadline) = request.deadline {
                        if Instant::now() + delay >= deadline {
                            return FetchResult::failed(
                                &self.config.id,
                                DispatchError::Cancelled,
                                started.elapsed(),
                                attempts,
                            );
                        }
                    }

                    debug!(
                        source = %self.config.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn acquire_slot(
        &self,
        deadline: Option<Instant>,
    ) -> Result<SemaphorePermit<'_>, DispatchError> {
        match deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                tokio::time::timeout_at(deadline, self.limit.acquire())
                    .await
                    .map_err(|_| DispatchError::Cancelled)?
                    .map_err(|_| DispatchError::Transient("worker shut down".to_string()))
            }
            None => self
                .limit
                .acquire()
                .await
                .map_err(|_| DispatchError::Transient("worker shut down".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Transport that replays a scripted sequence of outcomes, then succeeds
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Value, DispatchError>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Value, DispatchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceTransport for ScriptedTransport {
        async fn call(&self, _params: &Value, _deadline: Option<Instant>) -> Result<Value, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"ok": true})))
        }
    }

    fn test_config() -> SourceConfig {
        let mut config = SourceConfig::new("nasdaq", "https://api.nasdaq.example/v1");
        config.max_retries = 2;
        config.initial_backoff_ms = 1;
        config.max_backoff_ms = 5;
        config.jitter = false;
        config.burst_capacity = 100.0;
        config.requests_per_second = 100.0;
        config
    }

    fn worker_with(config: SourceConfig, transport: Arc<ScriptedTransport>) -> SourceWorker {
        SourceWorker::new(Arc::new(config), transport)
    }

    #[tokio::test]
    async fn test_fetch_success_first_attempt() {
        let transport = ScriptedTransport::new(vec![Ok(json!({"price": 101.5}))]);
        let worker = worker_with(test_config(), Arc::clone(&transport));

        let result = worker
            .fetch(&FetchRequest::new("nasdaq", json!({"symbol": "AAPL"})))
            .await;

        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.payload.unwrap()["price"], 101.5);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(DispatchError::Transient("connection reset".to_string())),
            Err(DispatchError::Timeout(Duration::from_millis(10))),
            Ok(json!({"ok": true})),
        ]);
        let worker = worker_with(test_config(), Arc::clone(&transport));

        let result = worker.fetch(&FetchRequest::new("nasdaq", json!({}))).await;

        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_surfaces_last_error() {
        let transport = ScriptedTransport::new(vec![
            Err(DispatchError::Transient("e1".to_string())),
            Err(DispatchError::Transient("e2".to_string())),
            Err(DispatchError::Transient("e3".to_string())),
        ]);
        let worker = worker_with(test_config(), Arc::clone(&transport));

        let result = worker.fetch(&FetchRequest::new("nasdaq", json!({}))).await;

        assert!(!result.success);
        // max_retries = 2 means 3 total attempts
        assert_eq!(result.attempts, 3);
        assert_eq!(transport.calls(), 3);
        assert!(matches!(result.error, Some(DispatchError::Transient(_))));
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(DispatchError::Permanent(
            "400 bad symbol".to_string(),
        ))]);
        let worker = worker_with(test_config(), Arc::clone(&transport));

        let result = worker.fetch(&FetchRequest::new("nasdaq", json!({}))).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(transport.calls(), 1);
        assert!(matches!(result.error, Some(DispatchError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_rate_limited_returns_immediately() {
        let mut config = test_config();
        config.burst_capacity = 1.0;
        config.requests_per_second = 0.001;
        let transport = ScriptedTransport::new(vec![]);
        let worker = worker_with(config, Arc::clone(&transport));

        let first = worker.fetch(&FetchRequest::new("nasdaq", json!({}))).await;
        assert!(first.success);

        let second = worker.fetch(&FetchRequest::new("nasdaq", json!({}))).await;
        assert!(!second.success);
        assert!(second.is_rate_limited());
        assert_eq!(second.attempts, 0);
        // No upstream call and no retry consumed for the refused request
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_circuit_open_fails_fast_without_transport_call() {
        let mut config = test_config();
        config.max_failures = 3;
        config.max_retries = 0;
        config.cooldown_secs = 60;
        let transport = ScriptedTransport::new(vec![
            Err(DispatchError::Transient("e".to_string())),
            Err(DispatchError::Transient("e".to_string())),
            Err(DispatchError::Transient("e".to_string())),
        ]);
        let worker = worker_with(config, Arc::clone(&transport));

        for _ in 0..3 {
            let result = worker.fetch(&FetchRequest::new("nasdaq", json!({}))).await;
            assert!(!result.success);
        }
        assert_eq!(transport.calls(), 3);

        // 4th call is short-circuited: no transport invocation
        let result = worker.fetch(&FetchRequest::new("nasdaq", json!({}))).await;
        assert!(matches!(result.error, Some(DispatchError::CircuitOpen)));
        assert_eq!(result.attempts, 1);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_expired_request_is_cancelled_before_admission() {
        let transport = ScriptedTransport::new(vec![]);
        let worker = worker_with(test_config(), Arc::clone(&transport));

        let request = FetchRequest::new("nasdaq", json!({}))
            .with_deadline(Instant::now() - Duration::from_millis(1));
        let tokens_before = worker.bucket().available();

        let result = worker.fetch(&request).await;

        assert!(matches!(result.error, Some(DispatchError::Cancelled)));
        assert_eq!(result.attempts, 0);
        assert_eq!(transport.calls(), 0);
        // No token was consumed for the cancelled request
        assert!(worker.bucket().available() >= tokens_before - 0.01);
    }

    #[tokio::test]
    async fn test_deadline_stops_retries() {
        let mut config = test_config();
        config.max_retries = 10;
        config.initial_backoff_ms = 200;
        let transport = ScriptedTransport::new(vec![
            Err(DispatchError::Transient("e1".to_string())),
            Err(DispatchError::Transient("e2".to_string())),
        ]);
        let worker = worker_with(config, Arc::clone(&transport));

        let request =
            FetchRequest::new("nasdaq", json!({})).with_timeout(Duration::from_millis(100));
        let result = worker.fetch(&request).await;

        assert!(!result.success);
        assert!(matches!(result.error, Some(DispatchError::Cancelled)));
        // First attempt ran, but the 200ms backoff would overrun the deadline
        assert_eq!(result.attempts, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_every_request_yields_exactly_one_result() {
        let transport = ScriptedTransport::new(vec![]);
        let worker = Arc::new(worker_with(test_config(), Arc::clone(&transport)));

        let mut handles = Vec::new();
        for i in 0..16 {
            let w = Arc::clone(&worker);
            handles.push(tokio::spawn(async move {
                w.fetch(&FetchRequest::new("nasdaq", json!({ "seq": i }))).await
            }));
        }

        let mut results = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.source_id, "nasdaq");
            results += 1;
        }
        assert_eq!(results, 16);
    }
}
