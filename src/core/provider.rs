//! Provider: turns an [`InferenceRequest`] into an HTTP call against a local
//! model-server instance, with per-instance rate limiting and same-instance
//! retry. Failover across *different* instances is the Dispatcher's job;
//! this module only ever talks to the one instance it's handed.

use crate::core::instance::Instance;
use crate::core::types::{FinishReason, InferenceChunk, InferenceRequest, InferenceResponse};
use crate::utils::error::{DispatchError, Result, RetryConfig, RetryPolicy};
use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout as tokio_timeout;
use tracing::warn;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 600;
const POOL_MAX_IDLE_PER_HOST: usize = 80;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

#[derive(Serialize)]
struct DownstreamOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Serialize)]
struct DownstreamRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    options: DownstreamOptions,
}

#[derive(Deserialize)]
struct DownstreamResponse {
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

fn normalize_prompt(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Very rough per-token cost estimate; zero for local instances (no `gpu_id`
/// implies a cloud-routed endpoint in principle, but this dispatcher only
/// targets local GPU instances, so this is always 0.0 here and exists to
/// satisfy the response schema / leave room for a future cloud provider).
fn estimate_cost_usd(_instance: &Instance, _prompt_tokens: u32, _completion_tokens: u32) -> f64 {
    0.0
}

pub struct Provider {
    client: Client,
    limiters: DashMap<String, Arc<Semaphore>>,
    max_concurrent_requests: u32,
    retry_config: RetryConfig,
}

impl Provider {
    pub fn new(max_concurrent_requests: u32, max_retries: u32, base_retry_delay_ms: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            client,
            limiters: DashMap::new(),
            max_concurrent_requests,
            retry_config: RetryConfig::from_dispatcher(max_retries, base_retry_delay_ms),
        }
    }

    fn limiter_for(&self, instance_id: &str) -> Arc<Semaphore> {
        self.limiters
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent_requests as usize)))
            .clone()
    }

    /// Generate a completion against `instance`, retrying transient failures
    /// on this same instance up to `maxRetries` times before giving up.
    pub async fn generate(&self, instance: &Instance, request: &InferenceRequest) -> Result<InferenceResponse> {
        let limiter = self.limiter_for(&instance.id);
        let _permit = limiter
            .acquire()
            .await
            .map_err(|_| DispatchError::Cancelled)?;

        let policy = RetryPolicy::new(self.retry_config.clone());
        let start = Instant::now();
        let timeout_duration = Duration::from_millis(request.timeout_ms);

        let downstream = DownstreamRequest {
            model: request.model_id.clone(),
            prompt: normalize_prompt(&request.prompt),
            system: request.system_prompt.as_deref().map(normalize_prompt),
            stream: false,
            options: DownstreamOptions {
                temperature: request.temperature,
                top_p: request.top_p,
                num_predict: request.max_tokens,
                stop: request.stop_sequences.clone(),
            },
        };

        let url = format!("{}/generate", instance.base_url);
        let result = policy
            .call(|_attempt| {
                let client = self.client.clone();
                let url = url.clone();
                let downstream = &downstream;
                async move {
                    let send = client.post(&url).json(downstream).send();
                    let response = match tokio_timeout(timeout_duration, send).await {
                        Ok(Ok(r)) => r,
                        Ok(Err(e)) => {
                            return Err(DispatchError::Transient {
                                instance_id: instance.id.clone(),
                                message: e.to_string(),
                            })
                        }
                        Err(_) => {
                            return Err(DispatchError::Timeout {
                                elapsed_ms: start.elapsed().as_millis() as u64,
                            })
                        }
                    };

                    let status = response.status();
                    if !status.is_success() {
                        let message = response.text().await.unwrap_or_default();
                        return Err(if is_transient_status(status) {
                            DispatchError::Transient {
                                instance_id: instance.id.clone(),
                                message,
                            }
                        } else {
                            DispatchError::Downstream {
                                instance_id: instance.id.clone(),
                                status: status.as_u16(),
                                message,
                            }
                        });
                    }

                    response
                        .json::<DownstreamResponse>()
                        .await
                        .map_err(|e| DispatchError::ParseError(e.to_string()))
                }
            })
            .await;

        let latency_ms = start.elapsed().as_millis() as u64;

        // A transient error surviving every retry attempt is no longer
        // "worth retrying" — it's a sustained downstream failure the
        // Dispatcher should account for and may fail over on (§7: "on
        // exhaustion becomes Downstream").
        let result = result.map_err(|e| match e {
            DispatchError::Transient { instance_id, message } => DispatchError::Downstream {
                instance_id,
                status: 502,
                message: format!("retries exhausted: {message}"),
            },
            other => other,
        });

        match result {
            Ok(body) => {
                let prompt_tokens = body.prompt_eval_count.unwrap_or(0);
                let completion_tokens = body.eval_count.unwrap_or(0);
                let finish_reason = if completion_tokens >= request.max_tokens {
                    FinishReason::MaxTokens
                } else {
                    FinishReason::Complete
                };
                Ok(InferenceResponse {
                    text: body.response,
                    model_id: request.model_id.clone(),
                    instance_id: instance.id.clone(),
                    prompt_tokens,
                    completion_tokens,
                    latency_ms,
                    finish_reason,
                    confidence: 1.0,
                    estimated_cost_usd: estimate_cost_usd(instance, prompt_tokens, completion_tokens),
                    diagnostic: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Streaming variant: NDJSON lines forwarded to `on_chunk` as they
    /// arrive, single consumer, terminal chunk carries token counts.
    pub async fn generate_stream<F>(
        &self,
        instance: &Instance,
        request: &InferenceRequest,
        mut on_chunk: F,
    ) -> Result<InferenceResponse>
    where
        F: FnMut(InferenceChunk),
    {
        let limiter = self.limiter_for(&instance.id);
        let _permit = limiter
            .acquire()
            .await
            .map_err(|_| DispatchError::Cancelled)?;

        let start = Instant::now();
        let downstream = DownstreamRequest {
            model: request.model_id.clone(),
            prompt: normalize_prompt(&request.prompt),
            system: request.system_prompt.as_deref().map(normalize_prompt),
            stream: true,
            options: DownstreamOptions {
                temperature: request.temperature,
                top_p: request.top_p,
                num_predict: request.max_tokens,
                stop: request.stop_sequences.clone(),
            },
        };

        let url = format!("{}/generate", instance.base_url);
        let response = self
            .client
            .post(&url)
            .json(&downstream)
            .send()
            .await
            .map_err(DispatchError::HttpClient)?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(DispatchError::Downstream {
                instance_id: instance.id.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();
        let mut prompt_tokens = 0u32;
        let mut completion_tokens = 0u32;

        while let Some(bytes) = stream.next().await {
            let bytes = bytes.map_err(DispatchError::HttpClient)?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(idx) = buffer.find('\n') {
                let line = buffer[..idx].trim().to_string();
                buffer.drain(..=idx);
                if line.is_empty() {
                    continue;
                }
                let parsed: DownstreamResponse = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => {
                        warn!(line, "skipping malformed streaming chunk");
                        continue;
                    }
                };
                text.push_str(&parsed.response);
                prompt_tokens = parsed.prompt_eval_count.unwrap_or(prompt_tokens);
                completion_tokens = parsed.eval_count.unwrap_or(completion_tokens);

                if parsed.done {
                    let finish_reason = if completion_tokens >= request.max_tokens {
                        FinishReason::MaxTokens
                    } else {
                        FinishReason::Complete
                    };
                    on_chunk(InferenceChunk {
                        text: parsed.response,
                        done: true,
                        finish_reason: Some(finish_reason),
                        prompt_tokens: Some(prompt_tokens),
                        completion_tokens: Some(completion_tokens),
                    });
                    return Ok(InferenceResponse {
                        text,
                        model_id: request.model_id.clone(),
                        instance_id: instance.id.clone(),
                        prompt_tokens,
                        completion_tokens,
                        latency_ms: start.elapsed().as_millis() as u64,
                        finish_reason,
                        confidence: 1.0,
                        estimated_cost_usd: estimate_cost_usd(instance, prompt_tokens, completion_tokens),
                        diagnostic: None,
                    });
                }
                on_chunk(InferenceChunk {
                    text: parsed.response,
                    done: false,
                    finish_reason: None,
                    prompt_tokens: None,
                    completion_tokens: None,
                });
            }
        }

        Err(DispatchError::ParseError("stream ended without a terminal chunk".into()))
    }

    /// Embedding pass-through, per the supplemented `/embeddings` surface.
    pub async fn embed(&self, instance: &Instance, model_id: &str, prompt: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", instance.base_url);
        let body = serde_json::json!({ "model": model_id, "prompt": normalize_prompt(prompt) });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(DispatchError::HttpClient)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(DispatchError::Downstream {
                instance_id: instance.id.clone(),
                status: status.as_u16(),
                message: "embedding request failed".into(),
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::ParseError(e.to_string()))?;
        Ok(parsed.embedding)
    }
}

/// Classify an HTTP status the way the retry policy expects: 429 and 5xx are
/// transient, everything else (validation, auth, not-found) is terminal.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Monotonic counter used to label generated request ids when the caller
/// doesn't supply one (e.g. from an HTTP handler before validation).
pub fn next_request_ordinal() -> u64 {
    REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PromptType;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(timeout_ms: u64) -> InferenceRequest {
        InferenceRequest {
            request_id: "r1".into(),
            model_id: "7b".into(),
            prompt: "hello   world".into(),
            system_prompt: None,
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: 64,
            stop_sequences: vec![],
            timeout_ms,
            preferred_gpu_id: None,
            prompt_type: PromptType::Completion,
        }
    }

    #[tokio::test]
    async fn generate_parses_downstream_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "pong",
                "model": "7b",
                "done": true,
                "prompt_eval_count": 3,
                "eval_count": 1
            })))
            .mount(&server)
            .await;

        let instance = Instance::new("test".into(), None, 0, 8_000, Default::default())
            .with_base_url(server.uri());
        let provider = Provider::new(4, 3, 50);
        let req = request(5_000);
        let result = provider.generate(&instance, &req).await.unwrap();
        assert_eq!(result.text, "pong");
        assert_eq!(result.completion_tokens, 1);
    }

    #[tokio::test]
    async fn generate_escalates_exhausted_transient_to_downstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let instance = Instance::new("test".into(), None, 0, 8_000, Default::default())
            .with_base_url(server.uri());
        let provider = Provider::new(4, 2, 10);
        let req = request(5_000);
        let err = provider.generate(&instance, &req).await.unwrap_err();
        // every attempt saw a 503 (Transient), so once retries are exhausted
        // the Dispatcher sees Downstream and may fail over to another instance.
        assert!(!err.is_retryable());
        assert!(err.triggers_failover());
        assert!(matches!(err, DispatchError::Downstream { .. }));
    }
}
