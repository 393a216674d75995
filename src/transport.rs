//! Transport seam: the injected per-source client
//!
//! Each upstream source supplies one implementation of [`SourceTransport`]
//! (HTTP, gRPC, WebSocket, the engine does not care). Transports are
//! registered in an explicit map handed to the engine at startup; there is no
//! runtime discovery or ambient registry.

use crate::error::DispatchError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// A single-capability client for one upstream source.
///
/// Implementations are expected to classify their own failures into the
/// [`DispatchError`] taxonomy (`Transient` for timeouts, connection failures,
/// 5xx and 429; `Permanent` for validation-style 4xx) and to honor the
/// caller-supplied deadline.
#[async_trait]
pub trait SourceTransport: Send + Sync {
    /// Perform one upstream call with an opaque parameter bag
    async fn call(&self, params: &Value, deadline: Option<Instant>) -> Result<Value, DispatchError>;
}

/// Explicit source-id → transport registration map, built at startup
pub type TransportMap = HashMap<String, Arc<dyn SourceTransport>>;
