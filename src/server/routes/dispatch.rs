//! Inference routes: the dispatcher's public surface for completions,
//! streamed completions, and embeddings.

use crate::core::provider::next_request_ordinal;
use crate::core::types::InferenceRequest;
use crate::server::state::AppState;
use crate::server::routes::{error_response, ApiResponse};
use actix_web::{post, web, HttpResponse, Responder};
use futures_util::stream::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Request body for both `/v1/dispatch` and `/v1/dispatch/stream`. Shares
/// the core [`InferenceRequest`] shape but lets the caller omit
/// `request_id`, which is filled in server-side.
#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    #[serde(default)]
    pub request_id: Option<String>,
    pub model_id: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub preferred_gpu_id: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    1.0
}
fn default_max_tokens() -> u32 {
    512
}
fn default_timeout_ms() -> u64 {
    30_000
}

impl From<DispatchBody> for InferenceRequest {
    fn from(body: DispatchBody) -> Self {
        InferenceRequest {
            request_id: body
                .request_id
                .unwrap_or_else(|| format!("req-{}", next_request_ordinal())),
            model_id: body.model_id,
            prompt: body.prompt,
            system_prompt: body.system_prompt,
            temperature: body.temperature,
            top_p: body.top_p,
            max_tokens: body.max_tokens,
            stop_sequences: body.stop_sequences,
            timeout_ms: body.timeout_ms,
            preferred_gpu_id: body.preferred_gpu_id,
            prompt_type: crate::core::types::PromptType::Completion,
        }
    }
}

#[post("/v1/dispatch")]
pub async fn dispatch(state: web::Data<AppState>, body: web::Json<DispatchBody>) -> impl Responder {
    let request: InferenceRequest = body.into_inner().into();
    match state.service.dispatcher().dispatch(request).await {
        Ok(response) => {
            state.metrics.record_outcome("success");
            HttpResponse::Ok().json(ApiResponse::success(response))
        }
        Err(e) => {
            state.metrics.record_outcome(outcome_label(&e));
            error_response(&e)
        }
    }
}

#[post("/v1/dispatch/stream")]
pub async fn dispatch_stream(state: web::Data<AppState>, body: web::Json<DispatchBody>) -> impl Responder {
    let request: InferenceRequest = body.into_inner().into();
    let (tx, rx) = mpsc::channel::<crate::core::types::InferenceChunk>(32);
    let service = state.service.clone();
    let metrics = state.metrics.clone();

    tokio::spawn(async move {
        let result = service
            .dispatcher()
            .dispatch_stream(request, |chunk| {
                let _ = tx.try_send(chunk);
            })
            .await;
        match result {
            Ok(_) => metrics.record_outcome("success"),
            Err(e) => metrics.record_outcome(outcome_label(&e)),
        }
    });

    let body_stream = ReceiverStream::new(rx).map(|chunk| {
        let mut line = serde_json::to_string(&chunk).unwrap_or_default();
        line.push('\n');
        Ok::<_, actix_web::Error>(web::Bytes::from(line))
    });

    HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(body_stream)
}

#[derive(Debug, Deserialize)]
pub struct EmbedBody {
    pub model_id: String,
    pub prompt: String,
}

#[post("/v1/embeddings")]
pub async fn embed(state: web::Data<AppState>, body: web::Json<EmbedBody>) -> impl Responder {
    match state.service.dispatcher().embed(&body.model_id, &body.prompt).await {
        Ok(vector) => {
            state.metrics.record_outcome("success");
            HttpResponse::Ok().json(ApiResponse::success(vector))
        }
        Err(e) => {
            state.metrics.record_outcome(outcome_label(&e));
            error_response(&e)
        }
    }
}

/// Short outcome label for the metrics sink, distinct from the full error
/// message (`DispatchError`'s `Display` includes per-instance detail we
/// don't want exploding the metric's cardinality).
fn outcome_label(error: &crate::utils::error::DispatchError) -> &'static str {
    use crate::utils::error::DispatchError::*;
    match error {
        Validation(_) => "validation",
        NoHealthyInstance { .. } => "no_healthy_instance",
        Transient { .. } => "transient",
        Downstream { .. } => "downstream",
        Timeout { .. } => "timeout",
        ParseError(_) => "parse_error",
        Cancelled => "cancelled",
        NotFound(_) => "not_found",
        Config(_) | HttpClient(_) | Serialization(_) | Yaml(_) | Io(_) => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_body_defaults_request_id_when_absent() {
        let body = DispatchBody {
            request_id: None,
            model_id: "7b".into(),
            prompt: "hi".into(),
            system_prompt: None,
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: 64,
            stop_sequences: vec![],
            timeout_ms: 5_000,
            preferred_gpu_id: None,
        };
        let request: InferenceRequest = body.into();
        assert!(request.request_id.starts_with("req-"));
    }
}
