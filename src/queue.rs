//! Dispatch queue: bounded hand-off between workers and consumers
//!
//! Fixed-capacity FIFO with O(1) enqueue/dequeue. Enqueue never blocks the
//! producing worker: at capacity the oldest item is dropped and counted, so a
//! stalled consumer can never wedge the fetch pipeline. Dequeue blocks the
//! consumer until an item arrives, a timeout fires, or the queue is closed.
//!
//! # Example
//!
//! ```
//! use quasar::queue::DispatchQueue;
//! use quasar::worker::FetchResult;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue = DispatchQueue::new(16);
//!
//! queue.enqueue(FetchResult::ok("nasdaq", json!({}), Duration::ZERO, 1));
//! let item = queue.dequeue().await.unwrap();
//! assert_eq!(item.result.source_id, "nasdaq");
//! # }
//! ```

use crate::worker::FetchResult;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::warn;

/// A fetch result in transit from a worker to a consumer
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// The result being handed off
    pub result: FetchResult,
    /// When the producer enqueued it
    pub enqueued_at: Instant,
}

impl QueueItem {
    /// Time spent waiting in the queue
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<QueueItem>,
    closed: bool,
    total_received: u64,
    total_dropped: u64,
}

/// Fixed-capacity, drop-oldest FIFO for fetch results
#[derive(Debug)]
pub struct DispatchQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl DispatchQueue {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
                total_received: 0,
                total_dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a result without ever blocking the producer.
    ///
    /// At capacity the oldest item is dropped and counted. Enqueues after
    /// `close` are discarded.
    pub fn enqueue(&self, result: FetchResult) {
        let mut inner = self.inner.lock().expect("dispatch queue lock poisoned");

        if inner.closed {
            return;
        }

        inner.total_received += 1;
        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
            inner.total_dropped += 1;
            warn!(
                source = %result.source_id,
                capacity = self.capacity,
                "dispatch queue full, dropped oldest item"
            );
        }

        inner.items.push_back(QueueItem {
            result,
            enqueued_at: Instant::now(),
        });
        drop(inner);

        self.notify.notify_one();
    }

    /// Dequeue the oldest item, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<QueueItem> {
        loop {
            // Register for wakeup before checking, so an enqueue between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("dispatch queue lock poisoned");
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Dequeue with an upper bound on the wait.
    ///
    /// Returns `None` on timeout or when the queue is closed and drained.
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Option<QueueItem> {
        tokio::time::timeout(timeout, self.dequeue())
            .await
            .unwrap_or(None)
    }

    /// Drain up to `max` items without waiting
    pub fn dequeue_batch(&self, max: usize) -> Vec<QueueItem> {
        let mut inner = self.inner.lock().expect("dispatch queue lock poisoned");
        let take = max.min(inner.items.len());
        inner.items.drain(..take).collect()
    }

    /// Close the queue: producers are ignored, consumers drain then observe
    /// end-of-stream
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("dispatch queue lock poisoned");
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Number of items currently queued
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("dispatch queue lock poisoned")
            .items
            .len()
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue depth and drop counters
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("dispatch queue lock poisoned");
        QueueStats {
            depth: inner.items.len(),
            capacity: self.capacity,
            total_received: inner.total_received,
            total_dropped: inner.total_dropped,
        }
    }
}

/// Queue depth and drop statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Items currently queued
    pub depth: usize,
    /// Configured capacity
    pub capacity: usize,
    /// Total items ever enqueued
    pub total_received: u64,
    /// Total items dropped to make room for newer ones
    pub total_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn result(seq: u64) -> FetchResult {
        FetchResult::ok("nasdaq", json!({ "seq": seq }), Duration::ZERO, 1)
    }

    fn seq(item: &QueueItem) -> u64 {
        item.result.payload.as_ref().unwrap()["seq"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = DispatchQueue::new(8);
        for i in 0..3 {
            queue.enqueue(result(i));
        }

        assert_eq!(seq(&queue.dequeue().await.unwrap()), 0);
        assert_eq!(seq(&queue.dequeue().await.unwrap()), 1);
        assert_eq!(seq(&queue.dequeue().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_drop_oldest_at_capacity() {
        let queue = DispatchQueue::new(2);
        queue.enqueue(result(1));
        queue.enqueue(result(2));
        queue.enqueue(result(3));

        let stats = queue.stats();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.total_received, 3);
        assert_eq!(stats.total_dropped, 1);

        assert_eq!(seq(&queue.dequeue().await.unwrap()), 2);
        assert_eq!(seq(&queue.dequeue().await.unwrap()), 3);
    }

    #[tokio::test]
    async fn test_len_never_exceeds_capacity() {
        let queue = DispatchQueue::new(4);
        for i in 0..50 {
            queue.enqueue(result(i));
            assert!(queue.len() <= 4);
        }
        assert_eq!(queue.stats().total_dropped, 46);
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let queue = Arc::new(DispatchQueue::new(4));

        let producer_queue = Arc::clone(&queue);
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer_queue.enqueue(result(7));
        });

        let started = Instant::now();
        let item = queue.dequeue().await.unwrap();
        assert_eq!(seq(&item), 7);
        assert!(started.elapsed() >= Duration::from_millis(25));

        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_timeout_on_empty() {
        let queue = DispatchQueue::new(4);
        let item = queue.dequeue_timeout(Duration::from_millis(20)).await;
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_batch() {
        let queue = DispatchQueue::new(8);
        for i in 0..5 {
            queue.enqueue(result(i));
        }

        let batch = queue.dequeue_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(seq(&batch[0]), 0);
        assert_eq!(seq(&batch[2]), 2);
        assert_eq!(queue.len(), 2);

        // Asking for more than queued drains what exists
        let rest = queue.dequeue_batch(100);
        assert_eq!(rest.len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumer() {
        let queue = Arc::new(DispatchQueue::new(4));

        let consumer_queue = Arc::clone(&queue);
        let consumer = tokio::spawn(async move { consumer_queue.dequeue().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_drains_remaining_items() {
        let queue = DispatchQueue::new(4);
        queue.enqueue(result(1));
        queue.close();

        // Remaining item still delivered, then end-of-stream
        assert_eq!(seq(&queue.dequeue().await.unwrap()), 1);
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_discarded() {
        let queue = DispatchQueue::new(4);
        queue.close();
        queue.enqueue(result(1));

        assert_eq!(queue.stats().total_received, 0);
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_many_producers_one_consumer() {
        let queue = Arc::new(DispatchQueue::new(256));

        let mut producers = Vec::new();
        for p in 0..4 {
            let q = Arc::clone(&queue);
            producers.push(tokio::spawn(async move {
                for i in 0..16 {
                    q.enqueue(result(p * 100 + i));
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let mut received = 0;
        while queue.dequeue_timeout(Duration::from_millis(10)).await.is_some() {
            received += 1;
        }
        assert_eq!(received, 64);
        assert_eq!(queue.stats().total_dropped, 0);
    }

    #[tokio::test]
    async fn test_item_age() {
        let queue = DispatchQueue::new(4);
        queue.enqueue(result(1));
        tokio::time::sleep(Duration::from_millis(15)).await;

        let item = queue.dequeue().await.unwrap();
        assert!(item.age() >= Duration::from_millis(10));
    }
}
