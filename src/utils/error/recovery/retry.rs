//! Retry mechanism with exponential backoff

use super::types::RetryConfig;
use crate::utils::error::DispatchError;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry mechanism with exponential backoff.
///
/// Stops retrying as soon as the error is not [`DispatchError::is_retryable`],
/// since only transient/timeout failures are worth trying against the same
/// or a different instance.
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute a function with retry logic, honoring `max_retries`/`base_delay_ms`.
    pub async fn call<F, Fut, R>(&self, mut f: F) -> Result<R, DispatchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<R, DispatchError>>,
    {
        let mut attempt = 0;
        let mut delay = self.config.base_delay;

        loop {
            attempt += 1;

            match f(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "retry succeeded");
                    }
                    return Ok(result);
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    debug!(attempt, %err, ?delay, "retrying after transient error");

                    let actual_delay = if self.config.jitter {
                        let jitter_factor = 0.1;
                        let jitter =
                            delay.as_millis() as f64 * jitter_factor * (rand::random::<f64>() - 0.5);
                        Duration::from_millis((delay.as_millis() as f64 + jitter) as u64)
                    } else {
                        delay
                    };

                    tokio::time::sleep(actual_delay).await;

                    delay = std::cmp::min(
                        Duration::from_millis(
                            (delay.as_millis() as f64 * self.config.backoff_multiplier) as u64,
                        ),
                        self.config.max_delay,
                    );
                }
                Err(err) => {
                    if attempt > 1 {
                        warn!(attempt, %err, "retry exhausted or error not retryable");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        });
        let calls = AtomicU32::new(0);
        let result = policy
            .call(|_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DispatchError::Transient {
                            instance_id: "i0".into(),
                            message: "boom".into(),
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        });
        let calls = AtomicU32::new(0);
        let result: Result<(), DispatchError> = policy
            .call(|_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(DispatchError::Validation("bad".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
