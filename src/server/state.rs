//! Application state shared across HTTP handlers.

use crate::core::DispatchService;
use crate::monitoring::DispatchMetrics;
use std::sync::Arc;

/// HTTP server state shared across handlers. All fields are cheap to clone
/// (Arc-wrapped).
#[derive(Clone)]
pub struct AppState {
    pub service: DispatchService,
    pub metrics: Arc<DispatchMetrics>,
}

impl AppState {
    /// Shares the `DispatchService`'s own metrics registry rather than
    /// constructing a second one, so `/metrics` reflects the same counters
    /// the Dispatcher updates internally (cache hit/miss) as well as the
    /// per-request outcomes this layer records.
    pub fn new(service: DispatchService) -> Self {
        let metrics = service.metrics().clone();
        Self { service, metrics }
    }
}
