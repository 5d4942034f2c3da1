//! Prometheus-backed counters/gauges for dispatch outcomes, active
//! requests, and cache hit rate.
//!
//! One registry per process, held by [`crate::server::AppState`] and
//! updated alongside (not inside) the Dispatcher's own bookkeeping —
//! `StatsLedger` remains the source of truth for routing decisions;
//! this module only mirrors outcomes for the external sink.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

/// A process-wide metrics registry plus the handles the Dispatcher's
/// middleware increments on every request.
pub struct DispatchMetrics {
    registry: Registry,
    pub requests_total: IntCounter,
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
    pub dispatch_outcomes_total: IntCounterVec,
    pub active_requests: IntGauge,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounter::new(
            "dispatcher_requests_total",
            "Total inference requests received",
        )
        .expect("metric construction is infallible for a static name");
        let cache_hits_total =
            IntCounter::new("dispatcher_cache_hits_total", "Response cache hits")
                .expect("metric construction is infallible for a static name");
        let cache_misses_total =
            IntCounter::new("dispatcher_cache_misses_total", "Response cache misses")
                .expect("metric construction is infallible for a static name");
        let dispatch_outcomes_total = IntCounterVec::new(
            Opts::new(
                "dispatcher_outcomes_total",
                "Dispatch outcomes by error kind ('success' for a completed dispatch)",
            ),
            &["outcome"],
        )
        .expect("metric construction is infallible for a static name");
        let active_requests = IntGauge::new(
            "dispatcher_active_requests",
            "In-flight requests across all instances",
        )
        .expect("metric construction is infallible for a static name");

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(cache_hits_total.clone()),
            Box::new(cache_misses_total.clone()),
            Box::new(dispatch_outcomes_total.clone()),
            Box::new(active_requests.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                warn!(error = %e, "failed to register metric collector");
            }
        }

        Self {
            registry,
            requests_total,
            cache_hits_total,
            cache_misses_total,
            dispatch_outcomes_total,
            active_requests,
        }
    }

    /// Record one completed dispatch. `outcome` is `"success"` or an error
    /// kind name (`"downstream"`, `"timeout"`, `"no_healthy_instance"`, ...).
    pub fn record_outcome(&self, outcome: &str) {
        self.requests_total.inc();
        self.dispatch_outcomes_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_outcomes_and_renders_text_format() {
        let metrics = DispatchMetrics::new();
        metrics.record_outcome("success");
        metrics.record_outcome("timeout");
        metrics.record_cache_hit();

        let rendered = metrics.render();
        assert!(rendered.contains("dispatcher_requests_total 2"));
        assert!(rendered.contains("dispatcher_cache_hits_total 1"));
    }

    #[test]
    fn active_requests_gauge_tracks_up_and_down() {
        let metrics = DispatchMetrics::new();
        metrics.active_requests.inc();
        metrics.active_requests.inc();
        metrics.active_requests.dec();
        assert_eq!(metrics.active_requests.get(), 1);
    }
}
