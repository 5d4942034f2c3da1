//! Response cache: fingerprints a request into a cache key and serves exact
//! repeats without a downstream round trip.
//!
//! Bounded by entry count, not bytes — an `lru::LruCache` behind a mutex
//! gives eviction-on-insert for free instead of a separate sweep.

use crate::core::types::{InferenceRequest, InferenceResponse};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub response: InferenceResponse,
    pub created_at: Instant,
}

pub struct ResponseCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(max_entries: usize, ttl_minutes: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(ttl_minutes * 60),
        }
    }

    /// SHA-256 over the fields that fully determine the response, per I6:
    /// model, whitespace-normalized prompt/system prompt, temperature
    /// rounded to one decimal, max tokens, and prompt type.
    pub fn fingerprint(request: &InferenceRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.model_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(Self::normalize(&request.prompt).as_bytes());
        hasher.update(b"\0");
        if let Some(system) = &request.system_prompt {
            hasher.update(Self::normalize(system).as_bytes());
        }
        hasher.update(b"\0");
        hasher.update(format!("{:.1}", request.temperature).as_bytes());
        hasher.update(b"\0");
        hasher.update(request.max_tokens.to_le_bytes());
        hasher.update(b"\0");
        hasher.update(format!("{:?}", request.prompt_type).as_bytes());
        hex::encode(hasher.finalize())
    }

    fn normalize(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Look up a cached response by fingerprint, honoring the sliding TTL.
    /// A hit refreshes `created_at`, sliding the entry's expiry forward.
    pub fn get(&self, fingerprint: &str) -> Option<InferenceResponse> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(fingerprint)?;
        if entry.created_at.elapsed() > self.ttl {
            entries.pop(fingerprint);
            return None;
        }
        entry.created_at = Instant::now();
        Some(entry.response.clone())
    }

    /// Insert or overwrite a cache entry. Idempotent: storing the same
    /// fingerprint twice just refreshes it, never duplicates state.
    pub fn put(&self, fingerprint: String, response: InferenceResponse) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.put(
            fingerprint.clone(),
            CacheEntry {
                fingerprint,
                response,
                created_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FinishReason, PromptType};

    fn request(prompt: &str, temperature: f32) -> InferenceRequest {
        InferenceRequest {
            request_id: "r".into(),
            model_id: "7b".into(),
            prompt: prompt.into(),
            system_prompt: None,
            temperature,
            top_p: 1.0,
            max_tokens: 64,
            stop_sequences: vec![],
            timeout_ms: 5_000,
            preferred_gpu_id: None,
            prompt_type: PromptType::Completion,
        }
    }

    fn response() -> InferenceResponse {
        InferenceResponse {
            text: "hi".into(),
            model_id: "7b".into(),
            instance_id: "gpu0-11434".into(),
            prompt_tokens: 1,
            completion_tokens: 1,
            latency_ms: 5,
            finish_reason: FinishReason::Complete,
            confidence: 1.0,
            estimated_cost_usd: 0.0,
            diagnostic: None,
        }
    }

    #[test]
    fn scenario_s5_nearby_temperatures_share_a_fingerprint() {
        let a = ResponseCache::fingerprint(&request("hello world", 0.11));
        let b = ResponseCache::fingerprint(&request("hello world", 0.13));
        assert_eq!(a, b);
    }

    #[test]
    fn whitespace_differences_do_not_change_fingerprint() {
        let a = ResponseCache::fingerprint(&request("hello   world", 0.1));
        let b = ResponseCache::fingerprint(&request("hello world", 0.1));
        assert_eq!(a, b);
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = ResponseCache::new(10, 5);
        let fp = ResponseCache::fingerprint(&request("hi", 0.5));
        cache.put(fp.clone(), response());
        assert!(cache.get(&fp).is_some());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = ResponseCache::new(1, 5);
        cache.put("a".into(), response());
        cache.put("b".into(), response());
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }
}
