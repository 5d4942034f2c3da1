//! Metrics registry: the external sink the Dispatcher reports into.
//!
//! This is an ambient concern, separate from the dispatch core — we
//! register and increment a handful of counters/gauges, we do not build
//! a TSDB. Exposed on the `/metrics` route in Prometheus text exposition
//! format.

pub mod metrics;

pub use metrics::DispatchMetrics;
