//! Wire-adjacent request/response types shared by the Provider, Dispatcher,
//! and ResponseCache. These are the dispatcher's own vocabulary, not the
//! downstream model-server's — `core::provider` translates to/from the
//! downstream shape.

use serde::{Deserialize, Serialize};

/// How a prompt is meant to be used, occasionally affecting scoring/caching
/// behavior (e.g. embedding requests never hit the text-completion cache key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    Completion,
    Chat,
    Embedding,
}

impl Default for PromptType {
    fn default() -> Self {
        Self::Completion
    }
}

/// A single inference request submitted to the Dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub request_id: String,
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
    #[serde(default)]
    pub prompt_type: PromptType,
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

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Complete,
    MaxTokens,
    Stop,
    Timeout,
    Error,
}

/// A completed (or degraded) response to an [`InferenceRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub text: String,
    pub model_id: String,
    pub instance_id: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
    pub finish_reason: FinishReason,
    pub confidence: f32,
    /// Populated for cloud-backed instances; zero for local GPU instances.
    #[serde(default)]
    pub estimated_cost_usd: f64,
    /// Present on degraded responses per the "tagged error value" contract.
    #[serde(default)]
    pub diagnostic: Option<String>,
}

/// One chunk of a streamed response. The final chunk in a stream carries
/// `finish_reason`/token counts and is the only one where they're meaningful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceChunk {
    pub text: String,
    pub done: bool,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
}
