//! Worker pool: routing and pool-wide saturation control
//!
//! The pool owns a fixed map of source → [`SourceWorker`] plus a global
//! semaphore capping total in-flight calls across all sources, independent of
//! the per-source token buckets. Routing is a direct lookup by source id;
//! requests for unknown sources fail immediately with a configuration error.

use crate::error::DispatchError;
use crate::worker::{FetchRequest, FetchResult, SourceWorker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::debug;

struct PoolEntry {
    worker: Arc<SourceWorker>,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Fixed set of source workers behind a global concurrency ceiling
pub struct WorkerPool {
    entries: HashMap<String, PoolEntry>,
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    acquire_timeout: Duration,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
}

impl WorkerPool {
    /// Create an empty pool with a global in-flight ceiling.
    ///
    /// `acquire_timeout` bounds how long a submission without its own
    /// deadline may wait for a slot, so submission never blocks indefinitely.
    pub fn new(max_in_flight: usize, acquire_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            acquire_timeout,
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    /// Register a worker. Replaces any previous worker for the same source.
    pub fn register(&mut self, worker: SourceWorker) {
        let id = worker.source_id().to_string();
        self.entries.insert(
            id,
            PoolEntry {
                worker: Arc::new(worker),
                successes: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            },
        );
    }

    /// Look up the worker for a source
    pub fn worker(&self, source_id: &str) -> Option<&Arc<SourceWorker>> {
        self.entries.get(source_id).map(|e| &e.worker)
    }

    /// All registered source ids
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    /// Submit a request to the matching worker.
    ///
    /// Blocks only on slot acquisition, bounded by the request deadline (or
    /// the pool's acquire timeout when the request carries none); the slot is
    /// released on completion regardless of outcome.
    pub async fn submit(&self, request: &FetchRequest) -> FetchResult {
        let started = Instant::now();

        let Some(entry) = self.entries.get(&request.source_id) else {
            debug!(source = %request.source_id, "request for unregistered source");
            let result = FetchResult::failed(
                request.source_id.clone(),
                DispatchError::UnknownSource(request.source_id.clone()),
                started.elapsed(),
                0,
            );
            self.total_failures.fetch_add(1, Ordering::Relaxed);
            return result;
        };

        let acquire_deadline = started + self.acquire_timeout;
        let (wait_until, timeout_err) = match request.deadline {
            Some(deadline) if deadline <= acquire_deadline => (deadline, DispatchError::Cancelled),
            _ => (acquire_deadline, DispatchError::Timeout(self.acquire_timeout)),
        };

        let permit = tokio::time::timeout_at(
            tokio::time::Instant::from_std(wait_until),
            self.semaphore.acquire(),
        )
        .await;

        let _permit = match permit {
            Ok(Ok(permit)) => permit,
            _ => {
                debug!(source = %request.source_id, "pool saturated, submission timed out");
                let result = FetchResult::failed(
                    request.source_id.clone(),
                    timeout_err,
                    started.elapsed(),
                    0,
                );
                entry.failures.fetch_add(1, Ordering::Relaxed);
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                return result;
            }
        };

        let result = entry.worker.fetch(request).await;

        if result.success {
            entry.successes.fetch_add(1, Ordering::Relaxed);
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.failures.fetch_add(1, Ordering::Relaxed);
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    /// Snapshot of pool saturation and per-source health counters
    pub fn stats(&self) -> PoolStats {
        let per_source = self
            .entries
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    SourceCounts {
                        successes: entry.successes.load(Ordering::Relaxed),
                        failures: entry.failures.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        PoolStats {
            in_flight: self.max_in_flight - self.semaphore.available_permits(),
            max_in_flight: self.max_in_flight,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            per_source,
        }
    }
}

/// Per-source success/failure counts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCounts {
    /// Completed fetches that produced a payload
    pub successes: u64,
    /// Completed fetches that produced an error
    pub failures: u64,
}

/// Pool saturation and health snapshot
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Requests currently holding a pool slot
    pub in_flight: usize,
    /// Global in-flight ceiling
    pub max_in_flight: usize,
    /// Aggregate successful fetches
    pub total_successes: u64,
    /// Aggregate failed fetches
    pub total_failures: u64,
    /// Per-source counters
    pub per_source: HashMap<String, SourceCounts>,
}

impl PoolStats {
    /// Pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_in_flight == 0 {
            0.0
        } else {
            (self.in_flight as f64 / self.max_in_flight as f64) * 100.0
        }
    }
}
