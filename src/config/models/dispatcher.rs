//! Dispatcher configuration — GPU instances, health probing, breaker and retry tuning.

use super::*;
use serde::{Deserialize, Serialize};

/// One statically-configured local model-server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInstanceConfig {
    /// Physical GPU index this instance is pinned to (as reported by `nvidia-smi`).
    pub gpu_id: u32,
    /// Port the local model-server process listens on.
    pub port: u16,
    /// Relative selection weight; higher favors this instance when scores tie.
    #[serde(default = "default_weight")]
    pub weight: f32,
}

/// Top-level dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Master switch: when false, the dispatcher always selects the single
    /// configured fallback instance with no scoring or health probing.
    #[serde(default = "default_true")]
    pub enable_gpu_load_balancing: bool,
    /// Statically-configured instances to provision at startup.
    #[serde(default)]
    pub gpu_instances: Vec<GpuInstanceConfig>,
    /// Interval between background health probes, in seconds.
    #[serde(default = "default_health_check_interval_sec")]
    pub health_check_interval_sec: u64,
    /// Error-rate fraction (0.0-1.0) above which an instance is scored as degraded.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Minimum completed requests before the error-rate threshold is evaluated.
    #[serde(default = "default_min_requests_for_error_rate")]
    pub min_requests_for_error_rate: u32,
    /// Consecutive-error count at which an instance is circuit-broken (Cooldown).
    #[serde(default = "default_error_breaker_threshold")]
    pub error_breaker_threshold: u32,
    /// Maximum in-flight requests a single instance may carry concurrently.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: u32,
    /// Response cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Maximum retry attempts per dispatch before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries, in milliseconds.
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    /// Maximum number of distinct instances tried for a single request before
    /// surfacing `NoHealthyInstance`.
    #[serde(default = "default_max_failovers")]
    pub max_failovers: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enable_gpu_load_balancing: true,
            gpu_instances: Vec::new(),
            health_check_interval_sec: default_health_check_interval_sec(),
            error_rate_threshold: default_error_rate_threshold(),
            min_requests_for_error_rate: default_min_requests_for_error_rate(),
            error_breaker_threshold: default_error_breaker_threshold(),
            max_concurrent_requests: default_max_concurrent_requests(),
            cache: CacheConfig::default(),
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_failovers: default_max_failovers(),
        }
    }
}

#[allow(dead_code)]
impl DispatcherConfig {
    /// Merge configurations, `other` taking precedence on non-default fields.
    pub fn merge(mut self, other: Self) -> Self {
        if !other.enable_gpu_load_balancing {
            self.enable_gpu_load_balancing = other.enable_gpu_load_balancing;
        }
        if !other.gpu_instances.is_empty() {
            self.gpu_instances = other.gpu_instances;
        }
        if other.health_check_interval_sec != default_health_check_interval_sec() {
            self.health_check_interval_sec = other.health_check_interval_sec;
        }
        if other.error_rate_threshold != default_error_rate_threshold() {
            self.error_rate_threshold = other.error_rate_threshold;
        }
        if other.min_requests_for_error_rate != default_min_requests_for_error_rate() {
            self.min_requests_for_error_rate = other.min_requests_for_error_rate;
        }
        if other.error_breaker_threshold != default_error_breaker_threshold() {
            self.error_breaker_threshold = other.error_breaker_threshold;
        }
        if other.max_concurrent_requests != default_max_concurrent_requests() {
            self.max_concurrent_requests = other.max_concurrent_requests;
        }
        self.cache = self.cache.merge(other.cache);
        if other.max_retries != default_max_retries() {
            self.max_retries = other.max_retries;
        }
        if other.base_retry_delay_ms != default_base_retry_delay_ms() {
            self.base_retry_delay_ms = other.base_retry_delay_ms;
        }
        if other.max_failovers != default_max_failovers() {
            self.max_failovers = other.max_failovers;
        }
        self
    }

    /// Validate the dispatcher configuration.
    ///
    /// An empty `gpu_instances` list is valid even when load balancing is
    /// enabled: it just means the registry falls back to GPU autodiscovery
    /// at startup instead of the explicit topology.
    pub fn validate(&self) -> Result<(), String> {
        if self.health_check_interval_sec == 0 {
            return Err("health_check_interval_sec cannot be 0".into());
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err("error_rate_threshold must be between 0.0 and 1.0".into());
        }
        if self.max_concurrent_requests == 0 {
            return Err("max_concurrent_requests cannot be 0".into());
        }
        let mut seen = std::collections::HashSet::new();
        for inst in &self.gpu_instances {
            if !seen.insert(inst.port) {
                return Err(format!("duplicate port {} in gpu_instances", inst.port));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval_sec() -> u64 {
    30
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_min_requests_for_error_rate() -> u32 {
    20
}

fn default_error_breaker_threshold() -> u32 {
    3
}

fn default_max_concurrent_requests() -> u32 {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    200
}

fn default_max_failovers() -> u32 {
    2
}
