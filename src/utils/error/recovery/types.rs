//! Shared configuration types for recovery primitives (retry).

use std::time::Duration;

/// Configuration for [`super::retry::RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling applied to the exponentially-growing delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Whether to add +/-10% jitter to each delay.
    pub jitter: bool,
}

impl RetryConfig {
    /// Build a retry config from the dispatcher's `max_retries`/`base_retry_delay_ms`.
    pub fn from_dispatcher(max_retries: u32, base_retry_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_retries.max(1),
            base_delay: Duration::from_millis(base_retry_delay_ms),
            max_delay: Duration::from_millis(base_retry_delay_ms.saturating_mul(16).max(1000)),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}
