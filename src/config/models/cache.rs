//! Response cache configuration

use super::*;
use serde::{Deserialize, Serialize};

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable response caching
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sliding TTL applied to each entry on insert and on hit, in minutes
    #[serde(default = "default_cache_ttl_minutes")]
    pub ttl_minutes: u64,
    /// Maximum number of cached entries before LRU eviction kicks in
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_minutes: default_cache_ttl_minutes(),
            max_entries: default_cache_max_entries(),
        }
    }
}

#[allow(dead_code)]
impl CacheConfig {
    /// Merge cache configurations
    pub fn merge(mut self, other: Self) -> Self {
        if !other.enabled {
            self.enabled = other.enabled;
        }
        if other.ttl_minutes != default_cache_ttl_minutes() {
            self.ttl_minutes = other.ttl_minutes;
        }
        if other.max_entries != default_cache_max_entries() {
            self.max_entries = other.max_entries;
        }
        self
    }
}

fn default_true() -> bool {
    true
}
