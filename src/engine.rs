//! Engine: single handle over the pool, queue and metrics
//!
//! The engine is constructed once at process start and passed by handle to
//! all consumers; there is no ambient registry to look it up in. It wires
//! configured sources to their registered transports, fans requests out
//! through the worker pool, and runs a background drain task that periodically
//! moves small batches from the dispatch queue to a consumer channel for
//! pull-based access.
//!
//! ```text
//! fetch_one / fetch_batch ──► WorkerPool ──► SourceWorker ──► transport
//!                                  │
//! dispatch (fire-and-forget) ──────┘──► DispatchQueue ──► drain task ──► consumer rx
//! ```
//!
//! # Example
//!
//! ```no_run
//! use quasar::{Engine, EngineConfig, SourceConfig, TransportMap};
//! use serde_json::json;
//!
//! # fn transports() -> TransportMap { TransportMap::new() }
//! #[tokio::main]
//! async fn main() -> Result<(), quasar::DispatchError> {
//!     let mut config = EngineConfig::default();
//!     config.sources.push(SourceConfig::new("nasdaq", "https://api.nasdaq.example/v1"));
//!
//!     let (engine, drain_handle) = Engine::spawn(config, transports())?;
//!
//!     let result = engine.fetch_one("nasdaq", json!({"symbol": "AAPL"}), None).await;
//!     println!("success: {}", result.success);
//!
//!     engine.shutdown().await;
//!     drain_handle.await.expect("drain task panicked");
//!     Ok(())
//! }
//! ```

use crate::config::EngineConfig;
use crate::error::DispatchError;
use crate::metrics::{EngineMetrics, MetricsSnapshot, SourceHealth};
use crate::pool::{PoolStats, WorkerPool};
use crate::queue::{DispatchQueue, QueueItem, QueueStats};
use crate::transport::TransportMap;
use crate::worker::{FetchRequest, FetchResult, SourceWorker};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The dispatch engine: orchestrates workers, pool, queue and metrics
pub struct Engine {
    pool: Arc<WorkerPool>,
    queue: Arc<DispatchQueue>,
    metrics: Arc<EngineMetrics>,
    shutdown_tx: Arc<RwLock<Option<oneshot::Sender<()>>>>,
    results_rx: std::sync::Mutex<Option<mpsc::Receiver<QueueItem>>>,
}

impl Engine {
    /// Build the engine and spawn its background drain task.
    ///
    /// Every configured source must have a transport registered in
    /// `transports`; a missing transport is a configuration error. Returns
    /// the engine and a `JoinHandle` for the drain task, which runs until
    /// [`Engine::shutdown`] is called (or the engine is dropped).
    pub fn spawn(
        config: EngineConfig,
        transports: TransportMap,
    ) -> Result<(Self, JoinHandle<()>), DispatchError> {
        config.validate()?;

        let mut pool = WorkerPool::new(config.max_in_flight, config.acquire_timeout());
        for source in &config.sources {
            let transport = transports.get(&source.id).ok_or_else(|| {
                DispatchError::Config(format!(
                    "no transport registered for source '{}'",
                    source.id
                ))
            })?;
            pool.register(SourceWorker::new(
                Arc::new(source.clone()),
                Arc::clone(transport),
            ));
        }
        let pool = Arc::new(pool);

        let queue = Arc::new(DispatchQueue::new(config.queue_capacity));
        let metrics = Arc::new(EngineMetrics::new(config.latency_window));

        let (results_tx, results_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let drain_queue = Arc::clone(&queue);
        let drain_handle = tokio::spawn(run_drain_loop(
            drain_queue,
            results_tx,
            shutdown_rx,
            config.drain_interval(),
            config.drain_batch_size,
        ));

        info!(
            sources = config.sources.len(),
            max_in_flight = config.max_in_flight,
            queue_capacity = config.queue_capacity,
            "dispatch engine started"
        );

        Ok((
            Self {
                pool,
                queue,
                metrics,
                shutdown_tx: Arc::new(RwLock::new(Some(shutdown_tx))),
                results_rx: std::sync::Mutex::new(Some(results_rx)),
            },
            drain_handle,
        ))
    }

    /// Fetch once from a source and return the result to the caller
    pub async fn fetch_one(
        &self,
        source_id: &str,
        params: Value,
        deadline: Option<Instant>,
    ) -> FetchResult {
        let request = FetchRequest {
            source_id: source_id.to_string(),
            params,
            deadline,
        };
        let result = self.pool.submit(&request).await;
        self.metrics.record(&result);
        result
    }

    /// Fan a batch out through the pool concurrently.
    ///
    /// The output slice matches the input order regardless of completion
    /// order; a misconfigured entry yields its error in place without
    /// affecting its neighbors.
    pub async fn fetch_batch(&self, requests: Vec<FetchRequest>) -> Vec<FetchResult> {
        let results = join_all(requests.iter().map(|request| self.pool.submit(request))).await;
        for result in &results {
            self.metrics.record(result);
        }
        results
    }

    /// Fetch in the background and hand the result to the dispatch queue.
    ///
    /// This is the streaming path: results surface on the receiver returned
    /// by [`Engine::take_results`] rather than to the submitting caller.
    pub fn dispatch(&self, request: FetchRequest) {
        let pool = Arc::clone(&self.pool);
        let queue = Arc::clone(&self.queue);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let result = pool.submit(&request).await;
            metrics.record(&result);
            queue.enqueue(result);
        });
    }

    /// Take the consumer end of the drained-results channel.
    ///
    /// Yields `None` after the first call; there is a single consumer stream.
    pub fn take_results(&self) -> Option<mpsc::Receiver<QueueItem>> {
        self.results_rx
            .lock()
            .expect("engine results lock poisoned")
            .take()
    }

    /// Read-only metrics snapshot for health endpoints
    pub async fn metrics(&self) -> MetricsSnapshot {
        let pool_stats = self.pool.stats();
        let mut per_source = HashMap::new();

        for source_id in self.pool.sources() {
            if let Some(worker) = self.pool.worker(source_id) {
                let counts = pool_stats.per_source.get(source_id);
                per_source.insert(
                    source_id.to_string(),
                    SourceHealth {
                        circuit_state: worker.breaker().state().await.name().to_string(),
                        tokens_available: worker.bucket().available(),
                        successes: counts.map(|c| c.successes).unwrap_or(0),
                        failures: counts.map(|c| c.failures).unwrap_or(0),
                    },
                );
            }
        }

        self.metrics.snapshot(&self.queue.stats(), per_source)
    }

    /// Pool saturation snapshot
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Dispatch queue depth and drop counters
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Reset a source's circuit breaker and refill its token bucket
    pub async fn reset_source(&self, source_id: &str) -> Result<(), DispatchError> {
        let worker = self
            .pool
            .worker(source_id)
            .ok_or_else(|| DispatchError::UnknownSource(source_id.to_string()))?;
        worker.breaker().reset().await;
        worker.bucket().reset();
        Ok(())
    }

    /// Signal the drain task to flush and stop.
    ///
    /// Await the `JoinHandle` returned by [`Engine::spawn`] to be certain all
    /// queued results have been forwarded.
    pub async fn shutdown(&self) {
        let mut shutdown = self.shutdown_tx.write().await;
        if let Some(tx) = shutdown.take() {
            let _ = tx.send(());
            info!("dispatch engine shutdown signal sent");
        }
    }
}

/// Background task: periodically move small batches from the queue to the
/// consumer channel
async fn run_drain_loop(
    queue: Arc<DispatchQueue>,
    results_tx: mpsc::Sender<QueueItem>,
    mut shutdown_rx: oneshot::Receiver<()>,
    interval: Duration,
    batch_size: usize,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(
        interval_ms = interval.as_millis() as u64,
        batch_size, "dispatch drain loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                forward_batch(&queue, &results_tx, batch_size);
            }

            _ = &mut shutdown_rx => {
                // Flush everything still queued before stopping
                while forward_batch(&queue, &results_tx, batch_size) > 0 {}
                queue.close();
                debug!("dispatch drain loop stopped");
                break;
            }
        }
    }
}

fn forward_batch(
    queue: &DispatchQueue,
    results_tx: &mpsc::Sender<QueueItem>,
    batch_size: usize,
) -> usize {
    let batch = queue.dequeue_batch(batch_size);
    let count = batch.len();

    for item in batch {
        match results_tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                warn!(
                    source = %item.result.source_id,
                    "results channel full, dropping drained item"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("results consumer gone, discarding drained item");
            }
        }
    }

    count
}
