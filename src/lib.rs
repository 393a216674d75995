//! Quasar: resilient multi-source dispatch engine
//!
//! # Overview
//!
//! Quasar concurrently pulls data from many independent, unreliable upstream
//! sources, each with its own rate limits and failure modes. It provides:
//!
//! - **Token Bucket**: per-source admission control with continuous lazy refill
//! - **Circuit Breaker**: per-source failure isolation with a single half-open probe
//! - **Retry Policy**: bounded exponential backoff with jitter
//! - **Source Worker**: one source's admission → breaker → retry pipeline
//! - **Worker Pool**: source routing behind a global in-flight ceiling
//! - **Dispatch Queue**: fixed-capacity drop-oldest hand-off to consumers
//! - **Engine**: one handle over all of it, with aggregated metrics
//!
//! # Key Principles
//!
//! The crate is transport-agnostic: each source supplies a
//! [`SourceTransport`] implementation (HTTP, gRPC, WebSocket) registered in
//! an explicit map at startup. Failure isolation ends at the worker: no
//! error from one source can touch another source's state. Every request
//! yields exactly one [`FetchResult`]; nothing here is fatal to the process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      fetch_one / fetch_batch / dispatch │
//! └─────────────┬───────────────────────────┘
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Worker Pool                       │  ← global in-flight ceiling
//! │  (route by source id, semaphore)        │
//! └─────────────┬───────────────────────────┘
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Source Worker        (per source) │
//! │  Token Bucket → Retry → Circuit Breaker │
//! └─────────────┬───────────────────────────┘
//!               ▼
//!        Source Transport (injected)
//!               │
//!         results flow back:
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Dispatch Queue                    │  ← drop-oldest backpressure
//! │  (bounded FIFO, drain task → consumer)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use quasar::{Engine, EngineConfig, SourceConfig, TransportMap, DispatchError, SourceTransport};
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! struct QuoteApi;
//!
//! #[async_trait]
//! impl SourceTransport for QuoteApi {
//!     async fn call(&self, params: &Value, _deadline: Option<Instant>) -> Result<Value, DispatchError> {
//!         // real implementation performs the HTTP call here
//!         Ok(json!({ "symbol": params["symbol"], "price": 101.5 }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), DispatchError> {
//!     let mut config = EngineConfig::default();
//!     config.sources.push(SourceConfig::new("nasdaq", "https://api.nasdaq.example/v1"));
//!
//!     let mut transports = TransportMap::new();
//!     transports.insert("nasdaq".to_string(), Arc::new(QuoteApi));
//!
//!     let (engine, drain_handle) = Engine::spawn(config, transports)?;
//!
//!     let result = engine.fetch_one("nasdaq", json!({"symbol": "AAPL"}), None).await;
//!     assert!(result.success);
//!
//!     engine.shutdown().await;
//!     drain_handle.await.expect("drain task panicked");
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod token_bucket;
pub mod transport;
pub mod worker;

// Re-export main types for convenience
pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{EngineConfig, SourceConfig};
pub use engine::Engine;
pub use error::DispatchError;
pub use metrics::{EngineMetrics, MetricsSnapshot, SourceHealth};
pub use pool::{PoolStats, SourceCounts, WorkerPool};
pub use queue::{DispatchQueue, QueueItem, QueueStats};
pub use retry::RetryPolicy;
pub use token_bucket::TokenBucket;
pub use transport::{SourceTransport, TransportMap};
pub use worker::{FetchRequest, FetchResult, SourceWorker};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use quasar::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::config::{EngineConfig, SourceConfig};
    pub use super::engine::Engine;
    pub use super::error::DispatchError;
    pub use super::metrics::MetricsSnapshot;
    pub use super::queue::{DispatchQueue, QueueItem};
    pub use super::retry::RetryPolicy;
    pub use super::token_bucket::TokenBucket;
    pub use super::transport::{SourceTransport, TransportMap};
    pub use super::worker::{FetchRequest, FetchResult, SourceWorker};
}
