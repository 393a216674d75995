//! Engine metrics: lock-free counters plus a rolling latency window
//!
//! Counters are monotonically increasing atomics updated by every worker with
//! no global lock. Latency samples go into a bounded window behind a single
//! short-lived mutex; percentile estimation sorts a copy at snapshot time,
//! never on the record path.

use crate::queue::QueueStats;
use crate::worker::FetchResult;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Shared counters and latency samples for one engine
#[derive(Debug)]
pub struct EngineMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    window: usize,
    latencies_us: Mutex<VecDeque<u64>>,
}

impl EngineMetrics {
    /// Create metrics retaining the latest `window` latency samples
    pub fn new(window: usize) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            window,
            latencies_us: Mutex::new(VecDeque::with_capacity(window.min(4096))),
        }
    }

    /// Record one completed fetch
    pub fn record(&self, result: &FetchResult) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        let mut latencies = self.latencies_us.lock().expect("metrics lock poisoned");
        if latencies.len() >= self.window {
            latencies.pop_front();
        }
        latencies.push_back(result.latency.as_micros() as u64);
    }

    /// Total requests recorded
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Successful requests recorded
    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    /// Failed requests recorded
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// Build a serializable snapshot, folding in queue depth and per-source
    /// health gathered by the engine
    pub fn snapshot(
        &self,
        queue: &QueueStats,
        per_source: HashMap<String, SourceHealth>,
    ) -> MetricsSnapshot {
        let total = self.total_requests();
        let successes = self.successful_requests();
        let success_rate = if total == 0 {
            1.0
        } else {
            successes as f64 / total as f64
        };

        let mut samples: Vec<u64> = {
            let latencies = self.latencies_us.lock().expect("metrics lock poisoned");
            latencies.iter().copied().collect()
        };
        samples.sort_unstable();

        MetricsSnapshot {
            total_requests: total,
            successful_requests: successes,
            failed_requests: self.failed_requests(),
            success_rate,
            p50_latency_ms: percentile_ms(&samples, 0.50),
            p95_latency_ms: percentile_ms(&samples, 0.95),
            p99_latency_ms: percentile_ms(&samples, 0.99),
            queue_depth: queue.depth,
            queue_dropped: queue.total_dropped,
            per_source,
        }
    }
}

fn percentile_ms(sorted_us: &[u64], p: f64) -> f64 {
    if sorted_us.is_empty() {
        return 0.0;
    }
    let rank = ((sorted_us.len() - 1) as f64 * p).round() as usize;
    sorted_us[rank] as f64 / 1000.0
}

/// Per-source health in the metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    /// Circuit breaker state label: closed / open / half_open
    pub circuit_state: String,
    /// Tokens currently available in the source's bucket
    pub tokens_available: f64,
    /// Completed fetches that produced a payload
    pub successes: u64,
    /// Completed fetches that produced an error
    pub failures: u64,
}

/// Read-only engine metrics snapshot for health endpoints
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// All requests recorded
    pub total_requests: u64,
    /// Requests that produced a payload
    pub successful_requests: u64,
    /// Requests that produced an error
    pub failed_requests: u64,
    /// successful / total, 1.0 when idle
    pub success_rate: f64,
    /// Median fetch latency in milliseconds
    pub p50_latency_ms: f64,
    /// 95th percentile fetch latency in milliseconds
    pub p95_latency_ms: f64,
    /// 99th percentile fetch latency in milliseconds
    pub p99_latency_ms: f64,
    /// Items currently in the dispatch queue
    pub queue_depth: usize,
    /// Items dropped by the queue's overflow policy
    pub queue_dropped: u64,
    /// Per-source breaker state, admission headroom and outcome counts
    pub per_source: HashMap<String, SourceHealth>,
}
