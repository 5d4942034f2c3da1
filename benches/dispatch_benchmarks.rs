//! Benchmarks for the dispatcher's hot path: scoring candidates and the
//! response cache lookup, both called once per incoming request.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use dispatcher::core::{FinishReason, InferenceRequest, InstanceMetrics, PromptType, Scorer};
use std::hint::black_box;

fn request(preferred_gpu_id: Option<u32>) -> InferenceRequest {
    InferenceRequest {
        request_id: "bench".into(),
        model_id: "7b".into(),
        prompt: "summarize this paragraph for me please".into(),
        system_prompt: None,
        temperature: 0.7,
        top_p: 1.0,
        max_tokens: 256,
        stop_sequences: vec![],
        timeout_ms: 30_000,
        preferred_gpu_id,
        prompt_type: PromptType::Completion,
    }
}

fn metrics(active: u32, avg_latency_ms: f64, errors: u64, total: u64) -> InstanceMetrics {
    InstanceMetrics {
        active_requests: active,
        total_requests: total,
        success_count: total - errors,
        error_count: errors,
        consecutive_errors: 0,
        avg_response_time_ms: avg_latency_ms,
        last_response_time_ms: avg_latency_ms,
    }
}

fn bench_scorer(c: &mut Criterion) {
    let mut group = c.benchmark_group("scorer");

    group.bench_function("health_score_healthy", |b| {
        let m = metrics(1, 800.0, 2, 500);
        b.iter(|| black_box(Scorer::health_score(black_box(&m))));
    });

    group.bench_function("score_single_candidate", |b| {
        let m = metrics(1, 800.0, 2, 500);
        let req = request(None);
        b.iter(|| black_box(Scorer::score(black_box(&m), 0.95, Some(0), black_box(&req))));
    });

    // Selection scans every candidate's score once per dispatch; benchmark
    // that scan at a few fleet sizes.
    for fleet_size in [1usize, 4, 16, 64] {
        group.bench_with_input(
            BenchmarkId::new("select_over_fleet", fleet_size),
            &fleet_size,
            |b, &size| {
                let req = request(Some(3));
                let candidates: Vec<(InstanceMetrics, f32, Option<u32>)> = (0..size)
                    .map(|i| (metrics((i % 3) as u32, 500.0 + i as f64 * 50.0, 1, 200), 0.9, Some(i as u32)))
                    .collect();

                b.iter(|| {
                    let best = candidates
                        .iter()
                        .map(|(m, hs, gpu)| Scorer::score(m, *hs, *gpu, &req))
                        .fold(f64::MIN, f64::max);
                    black_box(best)
                });
            },
        );
    }

    group.finish();
}

fn bench_response_cache(c: &mut Criterion) {
    use dispatcher::core::{InferenceResponse, ResponseCache};

    let mut group = c.benchmark_group("response_cache");

    group.bench_function("fingerprint", |b| {
        let req = request(None);
        b.iter(|| black_box(ResponseCache::fingerprint(black_box(&req))));
    });

    for cache_size in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("get_hit", cache_size), &cache_size, |b, &size| {
            let cache = ResponseCache::new(size, 60);
            let req = request(None);
            let fingerprint = ResponseCache::fingerprint(&req);
            cache.put(
                fingerprint.clone(),
                InferenceResponse {
                    text: "cached response".into(),
                    model_id: req.model_id.clone(),
                    instance_id: "inst-0".into(),
                    prompt_tokens: 8,
                    completion_tokens: 32,
                    latency_ms: 120,
                    finish_reason: FinishReason::Complete,
                    confidence: 1.0,
                    estimated_cost_usd: 0.0,
                    diagnostic: None,
                },
            );

            b.iter(|| black_box(cache.get(black_box(&fingerprint))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_scorer, bench_response_cache);
criterion_main!(benches);
