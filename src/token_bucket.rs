//! Token bucket admission control for per-source rate limiting
//!
//! Tokens refill continuously at `refill_rate` per second and are consumed
//! atomically per request attempt. Refill is computed lazily at each call
//! from the elapsed time since the last check, with no background timer.
//!
//! # Example
//!
//! ```
//! use quasar::token_bucket::TokenBucket;
//!
//! // 5-token burst, refilling at 1 token/second
//! let bucket = TokenBucket::new(5.0, 1.0);
//!
//! assert!(bucket.try_consume(1.0));
//! assert!(bucket.available() <= 5.0);
//! ```

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter
///
/// Consumption is all-or-nothing: `try_consume` subtracts only when enough
/// tokens exist, otherwise the bucket is left unchanged. Callers that are
/// refused must queue or back off, not spin.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a new bucket, full at `capacity` tokens, refilling at
    /// `refill_rate` tokens per second
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Create a bucket admitting `requests_per_second` sustained, with an
    /// equal burst capacity
    pub fn per_second(requests_per_second: f64) -> Self {
        Self::new(requests_per_second, requests_per_second)
    }

    /// Create a bucket admitting `requests_per_minute` sustained, with an
    /// equal burst capacity
    pub fn per_minute(requests_per_minute: f64) -> Self {
        Self::new(requests_per_minute, requests_per_minute / 60.0)
    }

    /// Try to consume `n` tokens. Returns false and leaves the bucket
    /// unchanged when fewer than `n` tokens are available.
    pub fn try_consume(&self, n: f64) -> bool {
        let mut state = self.state.lock().expect("token bucket lock poisoned");
        Self::refill(&mut state, self.capacity, self.refill_rate);

        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Current token count after applying pending refill
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().expect("token bucket lock poisoned");
        Self::refill(&mut state, self.capacity, self.refill_rate);
        state.tokens
    }

    /// Refill the bucket to capacity
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("token bucket lock poisoned");
        state.tokens = self.capacity;
        state.last_refill = Instant::now();
    }

    /// Maximum token count
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(state: &mut BucketState, capacity: f64, refill_rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * refill_rate).min(capacity);
        state.last_refill = now;
    }
}
