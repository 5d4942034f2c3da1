//! Per-instance statistics: lock-free counters guarding the mutable half of
//! an [`crate::core::instance::Instance`].
//!
//! All fields use atomics with `Relaxed` ordering, mirroring the rationale
//! used throughout this dispatcher: routing decisions tolerate eventually
//! consistent state in exchange for zero-contention updates on the hot path.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Point-in-time snapshot of an instance's counters, consumed by the
/// [`crate::core::scorer::Scorer`] and the `health()` API.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct InstanceMetrics {
    pub active_requests: u32,
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub avg_response_time_ms: f64,
    pub last_response_time_ms: f64,
}

impl InstanceMetrics {
    /// `successCount / totalRequests`, or 1.0 when no requests have completed.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.success_count as f64 / self.total_requests as f64
        }
    }

    /// `errorCount / totalRequests`, or 0.0 when no requests have completed.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_requests as f64
        }
    }
}

/// Thread-safe per-instance counters: active, total, success, error,
/// consecutive-error, and EWMA latency (α=0.2).
#[derive(Debug)]
pub struct StatsLedger {
    active_requests: AtomicU32,
    total_requests: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    consecutive_errors: AtomicU32,
    avg_response_time_ms_bits: AtomicU64,
    last_response_time_ms_bits: AtomicU64,
}

impl Default for StatsLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsLedger {
    pub fn new() -> Self {
        Self {
            active_requests: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            avg_response_time_ms_bits: AtomicU64::new(0f64.to_bits()),
            last_response_time_ms_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// activeRequests++. Must be paired with exactly one of
    /// `report_success`/`report_failure`/`cancel` (happens-before guarantee).
    pub fn begin_request(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement-on-finalize for a cancelled in-flight request: restores the
    /// active counter without touching success/error counts.
    pub fn cancel(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    /// successCount++; totalRequests++; activeRequests--; consecutiveErrors=0;
    /// EWMA update with α=0.2.
    pub fn report_success(&self, latency_ms: f64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);

        let current = f64::from_bits(self.avg_response_time_ms_bits.load(Ordering::Relaxed));
        let updated = if current == 0.0 {
            latency_ms
        } else {
            0.8 * current + 0.2 * latency_ms
        };
        self.avg_response_time_ms_bits
            .store(updated.to_bits(), Ordering::Relaxed);
        self.last_response_time_ms_bits
            .store(latency_ms.to_bits(), Ordering::Relaxed);
    }

    /// errorCount++; totalRequests++; activeRequests--; consecutiveErrors++.
    pub fn report_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether accumulated failures should trip the circuit breaker: exactly
    /// `errorBreakerThreshold` consecutive failures, guarded by a minimum
    /// sample size to avoid flapping on a cold ledger (I5, P3).
    pub fn should_trip_breaker(&self, error_breaker_threshold: u32, min_requests_for_error_rate: u32) -> bool {
        self.consecutive_errors.load(Ordering::Relaxed) >= error_breaker_threshold
            && self.total_requests.load(Ordering::Relaxed) >= min_requests_for_error_rate as u64
    }

    /// Clear the consecutive-error streak without touching any other
    /// counter. Used when a health probe confirms liveness independently
    /// of the request path that would normally call `report_success`.
    pub fn reset_consecutive_errors(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InstanceMetrics {
        InstanceMetrics {
            active_requests: self.active_requests.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            avg_response_time_ms: f64::from_bits(self.avg_response_time_ms_bits.load(Ordering::Relaxed)),
            last_response_time_ms: f64::from_bits(self.last_response_time_ms_bits.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_count_conservation() {
        let ledger = StatsLedger::new();
        ledger.begin_request();
        ledger.begin_request();
        ledger.report_success(10.0);
        ledger.report_failure();
        assert_eq!(ledger.snapshot().active_requests, 0);
    }

    #[test]
    fn ewma_matches_spec_formula() {
        let ledger = StatsLedger::new();
        ledger.begin_request();
        ledger.report_success(200.0);
        assert_eq!(ledger.snapshot().avg_response_time_ms, 200.0);

        ledger.begin_request();
        ledger.report_success(150.0);
        // 0.8*200 + 0.2*150 = 190
        assert_eq!(ledger.snapshot().avg_response_time_ms, 190.0);
    }

    #[test]
    fn consecutive_errors_reset_on_success() {
        let ledger = StatsLedger::new();
        for _ in 0..3 {
            ledger.begin_request();
            ledger.report_failure();
        }
        assert_eq!(ledger.snapshot().consecutive_errors, 3);
        ledger.begin_request();
        ledger.report_success(5.0);
        assert_eq!(ledger.snapshot().consecutive_errors, 0);
    }

    #[test]
    fn breaker_trips_only_past_minimum_sample_size() {
        let ledger = StatsLedger::new();
        for _ in 0..3 {
            ledger.begin_request();
            ledger.report_failure();
        }
        // totalRequests == 3 < min_requests_for_error_rate == 20
        assert!(!ledger.should_trip_breaker(3, 20));
    }

    #[test]
    fn cancel_restores_active_without_touching_counters() {
        let ledger = StatsLedger::new();
        ledger.begin_request();
        ledger.cancel();
        let snap = ledger.snapshot();
        assert_eq!(snap.active_requests, 0);
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.error_count, 0);
    }
}
