//! Configuration data models
//!
//! This module defines all configuration structures used throughout the dispatcher.

pub mod cache;
pub mod dispatcher;
pub mod monitoring;
pub mod server;

// Re-export all configuration types
pub use cache::*;
pub use dispatcher::*;
pub use monitoring::*;
pub use server::*;

/// Default server bind host
pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Default server port
pub fn default_port() -> u16 {
    8000
}

/// Default timeout in seconds
pub fn default_timeout() -> u64 {
    30
}

/// Default maximum body size in bytes
pub fn default_max_body_size() -> usize {
    10 * 1024 * 1024 // 10MB
}

/// Default instance selection weight
pub fn default_weight() -> f32 {
    1.0
}

/// Default cache sliding TTL, in minutes
pub fn default_cache_ttl_minutes() -> u64 {
    60
}

/// Default maximum cache entry count
pub fn default_cache_max_entries() -> usize {
    1000
}

pub fn default_metrics_port() -> u16 {
    9090
}

pub fn default_metrics_path() -> String {
    "/metrics".to_string()
}

pub fn default_health_path() -> String {
    "/health".to_string()
}

pub fn default_service_name() -> String {
    "inference-dispatcher".to_string()
}
