//! Pure scoring: turns an instance's metrics (plus the request being routed)
//! into a comparable ranking score. Holds no state of its own — every
//! function here is deterministic in its inputs, which is what makes the
//! Dispatcher's selection step reproducible and easy to test in isolation.

use crate::core::stats::InstanceMetrics;
use crate::core::types::InferenceRequest;

pub struct Scorer;

impl Scorer {
    /// `healthScore`: a multiplicative penalty in `[0.1, 1.0]` derived from
    /// success rate, latency, and consecutive failures.
    pub fn health_score(metrics: &InstanceMetrics) -> f32 {
        let mut hs = 1.0_f64;
        hs *= metrics.success_rate();

        if metrics.avg_response_time_ms > 30_000.0 {
            hs *= 0.5;
        } else if metrics.avg_response_time_ms > 15_000.0 {
            hs *= 0.8;
        }

        hs *= 0.9_f64.powi(metrics.consecutive_errors as i32);

        hs.clamp(0.1, 1.0) as f32
    }

    /// Ranking score for one candidate instance against one request.
    /// Bounded to `[0, 120]`: the base term tops out at 100, the
    /// preferred-GPU bonus adds up to 20, and the healthScore multiplier
    /// only ever shrinks it from there.
    pub fn score(
        metrics: &InstanceMetrics,
        health_score: f32,
        gpu_id: Option<u32>,
        request: &InferenceRequest,
    ) -> f64 {
        let mut score = 100.0_f64;
        score -= 10.0 * metrics.active_requests as f64;
        score -= (metrics.avg_response_time_ms / 1000.0).min(50.0);
        if metrics.total_requests > 0 {
            score -= 50.0 * metrics.error_count as f64 / metrics.total_requests as f64;
        }
        if request.preferred_gpu_id.is_some() && request.preferred_gpu_id == gpu_id {
            score += 20.0;
        }

        score *= health_score as f64;
        score.max(0.0)
    }
}
