//! Error types for dispatch operations

use std::time::Duration;
use thiserror::Error;

/// Errors produced while fetching from an upstream source
#[derive(Debug, Error, Clone)]
pub enum DispatchError {
    /// Token bucket exhausted for the source
    #[error("rate limit exceeded for source '{0}'")]
    RateLimited(String),

    /// Circuit breaker is open, rejecting requests
    #[error("circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// Transient upstream error that may be retried
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent upstream error that should not be retried
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Timeout occurred
    #[error("operation timeout after {0:?}")]
    Timeout(Duration),

    /// Request routed to a source the engine does not know about
    #[error("unknown source '{0}'")]
    UnknownSource(String),

    /// Request deadline expired before completion
    #[error("request cancelled before completion")]
    Cancelled,

    /// Invalid engine or source configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::Transient(_) | DispatchError::Timeout(_)
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DispatchError::Permanent(_)
                | DispatchError::CircuitOpen
                | DispatchError::UnknownSource(_)
                | DispatchError::Cancelled
                | DispatchError::Config(_)
        )
    }

    /// Check if this error should contribute to circuit breaker failure count
    ///
    /// Short-circuited and locally-rejected calls never reached the upstream,
    /// so they say nothing about its health.
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(
            self,
            DispatchError::CircuitOpen
                | DispatchError::RateLimited(_)
                | DispatchError::Cancelled
                | DispatchError::UnknownSource(_)
                | DispatchError::Config(_)
        )
    }

    /// Classify an HTTP-style status code into a dispatch error.
    ///
    /// 429 and 5xx responses are transient (the upstream may recover);
    /// other 4xx responses are permanent validation failures.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => DispatchError::Transient(format!("429 rate limited: {}", message)),
            500..=599 => DispatchError::Transient(format!("{} upstream error: {}", status, message)),
            400..=499 => DispatchError::Permanent(format!("{} client error: {}", status, message)),
            _ => DispatchError::Transient(format!("unexpected status {}: {}", status, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient = DispatchError::Transient("connection reset".to_string());
        assert!(transient.is_transient());
        assert!(!transient.is_permanent());
        assert!(transient.should_trip_breaker());

        let timeout = DispatchError::Timeout(Duration::from_secs(5));
        assert!(timeout.is_transient());
        assert!(timeout.should_trip_breaker());

        let permanent = DispatchError::Permanent("malformed request".to_string());
        assert!(!permanent.is_transient());
        assert!(permanent.is_permanent());
        assert!(permanent.should_trip_breaker());

        let circuit_open = DispatchError::CircuitOpen;
        assert!(!circuit_open.is_transient());
        assert!(circuit_open.is_permanent());
        assert!(!circuit_open.should_trip_breaker());
    }

    #[test]
    fn test_local_rejections_never_trip_breaker() {
        assert!(!DispatchError::RateLimited("nasdaq".to_string()).should_trip_breaker());
        assert!(!DispatchError::Cancelled.should_trip_breaker());
        assert!(!DispatchError::UnknownSource("ghost".to_string()).should_trip_breaker());
        assert!(!DispatchError::Config("bad".to_string()).should_trip_breaker());
    }

    #[test]
    fn test_rate_limited_not_retried_by_engine() {
        let rl = DispatchError::RateLimited("yahoo".to_string());
        assert!(!rl.is_transient());
    }

    #[test]
    fn test_from_status() {
        assert!(DispatchError::from_status(429, "slow down").is_transient());
        assert!(DispatchError::from_status(503, "unavailable").is_transient());
        assert!(DispatchError::from_status(500, "boom").is_transient());
        assert!(DispatchError::from_status(400, "bad params").is_permanent());
        assert!(DispatchError::from_status(404, "no such feed").is_permanent());
    }

    #[test]
    fn test_display_includes_context() {
        let err = DispatchError::UnknownSource("cnn".to_string());
        assert!(err.to_string().contains("cnn"));

        let err = DispatchError::RateLimited("nasdaq".to_string());
        assert!(err.to_string().contains("nasdaq"));
    }
}
