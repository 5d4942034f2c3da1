//! The Dispatcher: the one entry point that ties instance selection,
//! request accounting, caching, and failover together.
//!
//! `dispatch` follows a fixed sequence: cache lookup, candidate filtering,
//! emergency probing if starved, scoring and selection, accounted dispatch
//! to a Provider, and failover on transient failure up to a fixed budget.
//! No step here holds a lock across an await that crosses into another
//! component — each component guards its own short critical sections.

use crate::config::DispatcherConfig;
use crate::core::cache::ResponseCache;
use crate::core::gpu::GpuProbe;
use crate::core::health::HealthProber;
use crate::core::instance::{Instance, InstanceRegistry};
use crate::core::provider::Provider;
use crate::core::scorer::Scorer;
use crate::core::types::{InferenceChunk, InferenceRequest, InferenceResponse};
use crate::monitoring::DispatchMetrics;
use crate::utils::error::{DispatchError, Result};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Serializable view of one instance for the `health()` API.
#[derive(Debug, Serialize)]
pub struct InstanceHealthView {
    pub id: String,
    pub gpu_id: Option<u32>,
    pub port: u16,
    pub is_healthy: bool,
    pub health_score: f32,
    pub active_requests: u32,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_temp_c: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_util_pct: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_util_pct: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub instances: Vec<InstanceHealthView>,
}

pub struct Dispatcher {
    registry: Arc<InstanceRegistry>,
    gpu_probe: Arc<GpuProbe>,
    health_prober: Arc<HealthProber>,
    provider: Provider,
    cache: ResponseCache,
    /// Shared with [`crate::server::state::AppState`] so the HTTP `/metrics`
    /// route reports the same counters this struct updates internally
    /// (cache hit/miss) rather than a second, always-zero registry.
    metrics: Arc<DispatchMetrics>,
    /// Live snapshot of the tunables that can change without a process
    /// restart (`reload_config` swaps this in one shot). GPU topology, the
    /// Provider's rate limiter, and the response cache's capacity are all
    /// fixed at construction — reload only affects the knobs read
    /// per-dispatch below.
    config: ArcSwap<DispatcherConfig>,
}

impl Dispatcher {
    pub async fn new(config: DispatcherConfig) -> Self {
        let registry = Arc::new(InstanceRegistry::new());
        let gpu_probe = Arc::new(GpuProbe::new());
        let gpus = if config.enable_gpu_load_balancing {
            gpu_probe.enumerate().await
        } else {
            Vec::new()
        };
        registry.provision(&config, &gpus).await;

        let health_prober = Arc::new(HealthProber::new(registry.clone(), config.health_check_interval_sec));
        let provider = Provider::new(config.max_concurrent_requests, config.max_retries, config.base_retry_delay_ms);
        let cache = ResponseCache::new(config.cache.max_entries, config.cache.ttl_minutes);

        Self {
            registry,
            gpu_probe,
            health_prober,
            provider,
            cache,
            metrics: Arc::new(DispatchMetrics::new()),
            config: ArcSwap::from_pointee(config),
        }
    }

    /// The metrics registry this Dispatcher updates (cache hit/miss). The
    /// HTTP layer shares this same `Arc` for `/metrics` and its own
    /// per-request outcome counters instead of holding a second registry.
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    fn current_config(&self) -> Arc<DispatcherConfig> {
        self.config.load_full()
    }

    /// Spawn the background health-probe loop. The caller owns the
    /// returned handle's lifetime (typically dropped at process shutdown).
    pub fn spawn_health_loop(&self) -> tokio::task::JoinHandle<()> {
        let prober = self.health_prober.clone();
        tokio::spawn(async move { prober.run().await })
    }

    /// Re-run GPU enumeration and reconcile the instance topology against
    /// the live config snapshot. Cheap to call repeatedly: `GpuProbe::enumerate`
    /// is itself cached.
    pub async fn refresh_topology(&self) {
        let config = self.current_config();
        let gpus = self.gpu_probe.enumerate().await;
        self.registry.provision(&config, &gpus).await;
    }

    /// Swap in a new `DispatcherConfig` snapshot and reconcile the instance
    /// topology against it. Rate limiter concurrency, retry budget, and
    /// cache capacity were fixed at construction and are unaffected.
    pub async fn reload_config(&self, config: DispatcherConfig) {
        let gpus = if config.enable_gpu_load_balancing {
            self.gpu_probe.enumerate().await
        } else {
            Vec::new()
        };
        self.registry.provision(&config, &gpus).await;
        self.config.store(Arc::new(config));
        info!("dispatcher config reloaded");
    }

    fn candidates(&self, model_id: &str) -> Vec<Arc<Instance>> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|i| i.is_healthy() && i.supports(model_id))
            .collect()
    }

    fn select(&self, candidates: &[Arc<Instance>], request: &InferenceRequest) -> Option<Arc<Instance>> {
        let mut scored: Vec<(f64, &Arc<Instance>)> = candidates
            .iter()
            .map(|instance| {
                let metrics = instance.metrics();
                let score = Scorer::score(&metrics, instance.health_score(), instance.gpu_id, request);
                (score, instance)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.into_iter().next().map(|(_, instance)| instance.clone())
    }

    /// Dispatch one request to completion, following the non-streaming path.
    pub async fn dispatch(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        if request.prompt.trim().is_empty() {
            return Err(DispatchError::Validation("prompt must not be empty".into()));
        }

        let fingerprint = ResponseCache::fingerprint(&request);
        if let Some(cached) = self.cache.get(&fingerprint) {
            self.metrics.record_cache_hit();
            return Ok(cached);
        }
        self.metrics.record_cache_miss();

        let mut candidates = self.candidates(&request.model_id);
        if candidates.is_empty() {
            self.health_prober.emergency_probe().await;
            candidates = self.candidates(&request.model_id);
            if candidates.is_empty() {
                return Err(DispatchError::NoHealthyInstance {
                    model: request.model_id.clone(),
                });
            }
        }

        let mut tried = std::collections::HashSet::new();
        let mut last_err = None;
        let config = self.current_config();

        for attempt in 0..=config.max_failovers {
            let remaining: Vec<Arc<Instance>> = candidates
                .iter()
                .filter(|i| !tried.contains(&i.id))
                .cloned()
                .collect();
            let Some(instance) = self.select(&remaining, &request) else {
                break;
            };
            tried.insert(instance.id.clone());

            instance.stats.begin_request();
            let result = self.provider.generate(&instance, &request).await;

            match result {
                Ok(mut response) => {
                    instance.stats.report_success(response.latency_ms as f64);
                    instance.recompute_health_score();
                    response.confidence = 1.0;
                    self.cache.put(fingerprint.clone(), response.clone());
                    return Ok(response);
                }
                Err(e) => {
                    instance.stats.report_failure();
                    instance.recompute_health_score();
                    let metrics = instance.metrics();
                    let breaker_tripped = instance
                        .stats
                        .should_trip_breaker(config.error_breaker_threshold, config.min_requests_for_error_rate);
                    let error_rate_tripped = metrics.total_requests >= config.min_requests_for_error_rate as u64
                        && metrics.error_rate() >= config.error_rate_threshold;
                    if breaker_tripped || error_rate_tripped {
                        instance.mark_unhealthy_from_breaker();
                    }
                    warn!(instance = %instance.id, attempt, error = %e, "dispatch attempt failed");
                    let failover = e.triggers_failover();
                    last_err = Some(e);
                    if !failover {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(DispatchError::NoHealthyInstance {
            model: request.model_id,
        }))
    }

    /// Streaming dispatch: selection/failover identical to `dispatch`, but
    /// chunks are forwarded to `on_chunk` as they arrive from the Provider.
    pub async fn dispatch_stream<F>(&self, request: InferenceRequest, mut on_chunk: F) -> Result<InferenceResponse>
    where
        F: FnMut(InferenceChunk),
    {
        let mut candidates = self.candidates(&request.model_id);
        if candidates.is_empty() {
            self.health_prober.emergency_probe().await;
            candidates = self.candidates(&request.model_id);
        }
        let Some(instance) = self.select(&candidates, &request) else {
            return Err(DispatchError::NoHealthyInstance {
                model: request.model_id,
            });
        };

        instance.stats.begin_request();
        let result = self.provider.generate_stream(&instance, &request, &mut on_chunk).await;
        match result {
            Ok(response) => {
                instance.stats.report_success(response.latency_ms as f64);
                instance.recompute_health_score();
                Ok(response)
            }
            Err(e) => {
                instance.stats.report_failure();
                instance.recompute_health_score();
                Err(e)
            }
        }
    }

    /// Embedding pass-through: shares the same candidate filtering/selection
    /// as `dispatch`, but skips the response cache and stats accounting
    /// stays limited to active-request bookkeeping since embeddings aren't
    /// scored on latency history.
    pub async fn embed(&self, model_id: &str, prompt: &str) -> Result<Vec<f32>> {
        let candidates = self.candidates(model_id);
        let dummy_request = InferenceRequest {
            request_id: String::new(),
            model_id: model_id.to_string(),
            prompt: prompt.to_string(),
            system_prompt: None,
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 0,
            stop_sequences: Vec::new(),
            timeout_ms: 30_000,
            preferred_gpu_id: None,
            prompt_type: crate::core::types::PromptType::Embedding,
        };
        let Some(instance) = self.select(&candidates, &dummy_request) else {
            return Err(DispatchError::NoHealthyInstance {
                model: model_id.to_string(),
            });
        };

        instance.stats.begin_request();
        let result = self.provider.embed(&instance, model_id, prompt).await;
        match &result {
            Ok(_) => instance.stats.report_success(0.0),
            Err(_) => instance.stats.report_failure(),
        }
        result
    }

    /// Cancel an in-flight request's accounting without recording it as a
    /// success or a failure.
    pub fn cancel(&self, instance_id: &str) {
        if let Some(instance) = self.registry.get(instance_id) {
            instance.stats.cancel();
        }
    }

    /// Operator escape hatch: force an instance back to healthy immediately.
    pub fn reset_instance(&self, instance_id: &str) -> bool {
        self.registry.reset(instance_id)
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Snapshot every instance's routing state plus, when a `gpu_id` is
    /// known, the GPU's current temperature/utilization reading.
    pub async fn health(&self) -> HealthReport {
        let mut instances = Vec::new();
        for instance in self.registry.snapshot().iter() {
            let metrics = instance.metrics();
            let gpu_health = match instance.gpu_id {
                Some(gpu_id) => self.gpu_probe.health_snapshot(gpu_id).await,
                None => None,
            };
            instances.push(InstanceHealthView {
                id: instance.id.clone(),
                gpu_id: instance.gpu_id,
                port: instance.port,
                is_healthy: instance.is_healthy(),
                health_score: instance.health_score(),
                active_requests: metrics.active_requests,
                success_rate: metrics.success_rate(),
                avg_response_time_ms: metrics.avg_response_time_ms,
                gpu_temp_c: gpu_health.as_ref().map(|h| h.temperature_c),
                gpu_util_pct: gpu_health.as_ref().map(|h| h.gpu_util_pct),
                mem_util_pct: gpu_health.map(|h| h.mem_util_pct),
            });
        }
        HealthReport { instances }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PromptType;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(model_id: &str, prompt: &str) -> InferenceRequest {
        InferenceRequest {
            request_id: "r1".into(),
            model_id: model_id.into(),
            prompt: prompt.into(),
            system_prompt: None,
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: 64,
            stop_sequences: vec![],
            timeout_ms: 5_000,
            preferred_gpu_id: None,
            prompt_type: PromptType::Completion,
        }
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_before_any_lookup() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).await;
        let err = dispatcher.dispatch(request("7b", "")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn no_candidates_returns_no_healthy_instance() {
        let mut config = DispatcherConfig::default();
        config.enable_gpu_load_balancing = false;
        let dispatcher = Dispatcher::new(config).await;
        dispatcher.registry().clear_for_test();
        let err = dispatcher.dispatch(request("nonexistent-model", "hi")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoHealthyInstance { .. }));
    }

    #[tokio::test]
    async fn scenario_s1_single_instance_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "pong",
                "done": true,
                "prompt_eval_count": 1,
                "eval_count": 1
            })))
            .mount(&server)
            .await;

        let mut config = DispatcherConfig::default();
        config.enable_gpu_load_balancing = false;
        let dispatcher = Dispatcher::new(config).await;
        dispatcher.registry().clear_for_test();
        dispatcher.registry().insert_for_test(
            Instance::new("mock".into(), None, 0, 8_000, Default::default()).with_base_url(server.uri()),
        );

        let response = dispatcher.dispatch(request("anything", "ping")).await.unwrap();
        assert_eq!(response.text, "pong");
    }

    #[tokio::test]
    async fn scenario_s5_cache_hit_skips_second_downstream_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "cached",
                "done": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = DispatcherConfig::default();
        config.enable_gpu_load_balancing = false;
        let dispatcher = Dispatcher::new(config).await;
        dispatcher.registry().clear_for_test();
        dispatcher.registry().insert_for_test(
            Instance::new("mock".into(), None, 0, 8_000, Default::default()).with_base_url(server.uri()),
        );

        let first = dispatcher.dispatch(request("7b-q4", "same prompt")).await.unwrap();
        let second = dispatcher.dispatch(request("7b-q4", "same prompt")).await.unwrap();
        assert_eq!(first.text, second.text);
        server.verify().await;
    }

    async fn failing_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        server
    }

    /// P7: with 3 failing instances and 1 healthy one, dispatch succeeds
    /// within `maxFailovers + 1` attempts.
    #[tokio::test]
    async fn scenario_p7_fails_over_to_the_one_healthy_instance() {
        let mut config = DispatcherConfig::default();
        config.enable_gpu_load_balancing = false;
        config.max_failovers = 2;
        config.max_retries = 1;
        config.base_retry_delay_ms = 1;
        let dispatcher = Dispatcher::new(config).await;
        dispatcher.registry().clear_for_test();

        let bad_a = failing_server().await;
        let bad_b = failing_server().await;
        let bad_c = failing_server().await;
        let good = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "ok",
                "done": true
            })))
            .mount(&good)
            .await;

        for (id, server) in [("a", &bad_a), ("b", &bad_b), ("c", &bad_c), ("d", &good)] {
            dispatcher.registry().insert_for_test(
                Instance::new(id.into(), None, 0, 8_000, Default::default()).with_base_url(server.uri()),
            );
        }

        let response = dispatcher.dispatch(request("any", "hi")).await.unwrap();
        assert_eq!(response.text, "ok");
    }

    /// P7: with 4 failing instances (more failures than the failover
    /// budget allows), dispatch returns `Downstream` after exactly
    /// `maxFailovers + 1` attempts — no healthy instance is left to try.
    #[tokio::test]
    async fn scenario_p7_exhausts_failover_budget_as_downstream() {
        let mut config = DispatcherConfig::default();
        config.enable_gpu_load_balancing = false;
        config.max_failovers = 2;
        config.max_retries = 1;
        config.base_retry_delay_ms = 1;
        let dispatcher = Dispatcher::new(config).await;
        dispatcher.registry().clear_for_test();

        for i in 0..4 {
            let server = failing_server().await;
            dispatcher.registry().insert_for_test(
                Instance::new(format!("bad-{i}"), None, 0, 8_000, Default::default()).with_base_url(server.uri()),
            );
            // Keep each mock server alive for the duration of the test by
            // leaking it; wiremock tears a server down when dropped.
            std::mem::forget(server);
        }

        let err = dispatcher.dispatch(request("any", "hi")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Downstream { .. }));
    }

    /// S4 / P3: once `consecutiveErrors` reaches `errorBreakerThreshold` on
    /// an instance that has already served `minRequestsForErrorRate`
    /// requests, the instance is marked unhealthy immediately, without
    /// waiting for the next HealthProber cycle.
    #[tokio::test]
    async fn scenario_s4_breaker_trips_after_threshold_then_emergency_probe_restores() {
        let mut config = DispatcherConfig::default();
        config.enable_gpu_load_balancing = false;
        config.max_failovers = 0;
        config.max_retries = 1;
        config.base_retry_delay_ms = 1;
        config.error_breaker_threshold = 3;
        config.min_requests_for_error_rate = 1;
        let dispatcher = Dispatcher::new(config).await;
        dispatcher.registry().clear_for_test();

        let server = failing_server().await;
        let instance = Instance::new("d".into(), None, 0, 8_000, Default::default()).with_base_url(server.uri());
        // Pre-seed enough total requests to satisfy the minimum-sample-size
        // guard, then two consecutive failures, mirroring the spec's literal
        // scenario state (`consecutiveErrors=2, totalRequests=25`) just
        // before the call that trips the breaker.
        for _ in 0..23 {
            instance.stats.begin_request();
            instance.stats.report_success(10.0);
        }
        instance.stats.begin_request();
        instance.stats.report_failure();
        instance.stats.begin_request();
        instance.stats.report_failure();
        dispatcher.registry().insert_for_test(instance);

        let err = dispatcher.dispatch(request("any", "hi")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoHealthyInstance { .. } | DispatchError::Downstream { .. }));
        let id = dispatcher.registry().snapshot()[0].id.clone();
        assert!(!dispatcher.registry().get(&id).unwrap().is_healthy());
    }

    /// `errorRateThreshold`: an instance whose lifetime error rate crosses
    /// the configured fraction is marked unhealthy even when its
    /// *consecutive* failure streak never reaches `errorBreakerThreshold`
    /// (interleaved successes keep resetting that counter).
    #[tokio::test]
    async fn error_rate_threshold_trips_independent_of_consecutive_breaker() {
        let mut config = DispatcherConfig::default();
        config.enable_gpu_load_balancing = false;
        config.max_failovers = 0;
        config.max_retries = 1;
        config.base_retry_delay_ms = 1;
        config.error_breaker_threshold = 10; // never reached by a single failure
        config.error_rate_threshold = 0.5;
        config.min_requests_for_error_rate = 1;
        let dispatcher = Dispatcher::new(config).await;
        dispatcher.registry().clear_for_test();

        let server = failing_server().await;
        let instance = Instance::new("e".into(), None, 0, 8_000, Default::default()).with_base_url(server.uri());
        // One success, one failure already on the books: rate is exactly at
        // the 0.5 threshold once this dispatch's failure lands (2 of 3).
        instance.stats.begin_request();
        instance.stats.report_success(10.0);
        instance.stats.begin_request();
        instance.stats.report_failure();
        dispatcher.registry().insert_for_test(instance);

        let err = dispatcher.dispatch(request("any", "hi")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Downstream { .. }));
        let id = dispatcher.registry().snapshot()[0].id.clone();
        let instance = dispatcher.registry().get(&id).unwrap();
        assert!(!instance.is_healthy());
        // The consecutive-error breaker alone would not have tripped yet.
        assert!(instance.metrics().consecutive_errors < 10);
    }
}
