//! Instance records: the stable endpoint abstraction the Dispatcher routes
//! requests across, and the registry that materializes/holds them.

use crate::config::DispatcherConfig;
use crate::core::gpu::Gpu;
use crate::core::stats::{InstanceMetrics, StatsLedger};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A logical addressable endpoint serving one or more models, typically
/// backed by a GPU-pinned local model-server process.
#[derive(Debug)]
pub struct Instance {
    pub id: String,
    pub gpu_id: Option<u32>,
    pub port: u16,
    pub base_url: String,
    pub max_memory_mb: u64,
    /// Empty means "serves every model" — used for the single fallback
    /// instance provisioned when GPU load balancing is disabled.
    pub supported_models: HashSet<String>,

    is_healthy: AtomicBool,
    health_score_bits: AtomicU32,
    last_health_check_ms: AtomicI64,
    last_error_ms: AtomicI64,

    pub stats: StatsLedger,
}

impl Instance {
    pub(crate) fn new(
        id: String,
        gpu_id: Option<u32>,
        port: u16,
        max_memory_mb: u64,
        supported_models: HashSet<String>,
    ) -> Self {
        Self {
            id,
            gpu_id,
            port,
            base_url: format!("http://127.0.0.1:{port}"),
            max_memory_mb,
            supported_models,
            is_healthy: AtomicBool::new(true),
            health_score_bits: AtomicU32::new(1.0f32.to_bits()),
            last_health_check_ms: AtomicI64::new(-1),
            last_error_ms: AtomicI64::new(-1),
            stats: StatsLedger::new(),
        }
    }

    /// Override the derived `base_url`. Used by tests that point an
    /// otherwise-normal instance at a mock server.
    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn supports(&self, model_id: &str) -> bool {
        self.supported_models.is_empty() || self.supported_models.contains(model_id)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::Relaxed)
    }

    pub fn health_score(&self) -> f32 {
        f32::from_bits(self.health_score_bits.load(Ordering::Relaxed))
    }

    pub fn last_health_check_ms(&self) -> Option<u64> {
        let v = self.last_health_check_ms.load(Ordering::Relaxed);
        (v >= 0).then_some(v as u64)
    }

    pub fn last_error_ms(&self) -> Option<u64> {
        let v = self.last_error_ms.load(Ordering::Relaxed);
        (v >= 0).then_some(v as u64)
    }

    pub fn metrics(&self) -> InstanceMetrics {
        self.stats.snapshot()
    }

    /// Recompute and store the health score from the current metrics.
    pub fn recompute_health_score(&self) {
        let score = crate::core::scorer::Scorer::health_score(&self.stats.snapshot());
        self.health_score_bits.store(score.to_bits(), Ordering::Relaxed);
    }

    pub fn mark_probe_result(&self, healthy: bool) {
        self.last_health_check_ms.store(now_millis() as i64, Ordering::Relaxed);
        let was_healthy = self.is_healthy.swap(healthy, Ordering::Relaxed);
        if healthy && !was_healthy {
            self.stats.reset_consecutive_errors();
            info!(instance = %self.id, "instance transitioned unhealthy -> healthy");
        } else if !healthy && was_healthy {
            self.last_error_ms.store(now_millis() as i64, Ordering::Relaxed);
            warn!(instance = %self.id, "instance transitioned healthy -> unhealthy");
        }
    }

    /// Trip the circuit breaker directly from dispatch-time accounting,
    /// independent of the next HealthProber cycle.
    pub fn mark_unhealthy_from_breaker(&self) {
        if self.is_healthy.swap(false, Ordering::Relaxed) {
            self.last_error_ms.store(now_millis() as i64, Ordering::Relaxed);
            warn!(instance = %self.id, "circuit breaker tripped: marking unhealthy");
        }
    }
}

/// Materializes and holds the set of [`Instance`] records.
///
/// Concurrency: a single-writer async mutex serializes `provision`/`reset`;
/// readers take lock-free `snapshot` copies via the underlying `DashMap`.
pub struct InstanceRegistry {
    instances: DashMap<String, Arc<Instance>>,
    write_lock: AsyncMutex<()>,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            write_lock: AsyncMutex::new(()),
        }
    }

    /// Synthesize Instances from static config and/or discovered GPUs.
    pub async fn provision(&self, config: &DispatcherConfig, gpus: &[Gpu]) {
        let _guard = self.write_lock.lock().await;
        self.instances.clear();

        if !config.enable_gpu_load_balancing {
            let instance = Instance::new("default".to_string(), None, 11434, 0, HashSet::new());
            self.instances.insert(instance.id.clone(), Arc::new(instance));
            return;
        }

        if !config.gpu_instances.is_empty() {
            for cfg in &config.gpu_instances {
                let gpu = gpus.iter().find(|g| g.id == cfg.gpu_id);
                let max_memory_mb = gpu.map(|g| g.memory_total_mb).unwrap_or(0);
                let supported_models: HashSet<String> = gpu
                    .map(|g| g.recommended_models().into_iter().collect())
                    .unwrap_or_default();
                let id = format!("gpu{}-{}", cfg.gpu_id, cfg.port);
                let instance = Instance::new(id.clone(), Some(cfg.gpu_id), cfg.port, max_memory_mb, supported_models);
                self.instances.insert(id, Arc::new(instance));
            }
            return;
        }

        const BASE_PORT: u16 = 11434;
        for gpu in gpus {
            let count = gpu.recommended_instance_count();
            let per_instance_mb = if count > 0 { gpu.memory_total_mb / count as u64 } else { 0 };
            let supported_models: HashSet<String> = gpu.recommended_models().into_iter().collect();
            for i in 0..count {
                let port = BASE_PORT + (gpu.id as u16) * 10 + i as u16;
                let id = format!("gpu{}-{}", gpu.id, port);
                let instance = Instance::new(id.clone(), Some(gpu.id), port, per_instance_mb, supported_models.clone());
                self.instances.insert(id, Arc::new(instance));
            }
        }
    }

    /// Consistent point-in-time copy of all instances.
    pub fn snapshot(&self) -> Vec<Arc<Instance>> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, instance: Instance) {
        self.instances.insert(instance.id.clone(), Arc::new(instance));
    }

    #[cfg(test)]
    pub(crate) fn clear_for_test(&self) {
        self.instances.clear();
    }

    /// Operator escape hatch: force an instance back to healthy without
    /// waiting for the next probe cycle.
    pub fn reset(&self, id: &str) -> bool {
        match self.instances.get(id) {
            Some(instance) => {
                instance.mark_probe_result(true);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuInstanceConfig;

    fn gpu(id: u32, memory_total_mb: u64) -> Gpu {
        Gpu {
            id,
            vendor: crate::core::gpu::GpuVendor::Nvidia,
            name: "test".into(),
            memory_total_mb,
            memory_free_mb: memory_total_mb,
            compute_tier: 75,
            supports_fp16: true,
            supports_bf16: false,
        }
    }

    #[tokio::test]
    async fn provision_single_instance_when_disabled() {
        let mut config = DispatcherConfig::default();
        config.enable_gpu_load_balancing = false;
        let registry = InstanceRegistry::new();
        registry.provision(&config, &[]).await;
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn explicit_gpu_instances_override_autodiscovery() {
        let mut config = DispatcherConfig::default();
        config.gpu_instances = vec![GpuInstanceConfig {
            gpu_id: 0,
            port: 9001,
            weight: 1.0,
        }];
        let registry = InstanceRegistry::new();
        registry.provision(&config, &[gpu(0, 24_000)]).await;
        assert_eq!(registry.len(), 1);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].port, 9001);
    }

    #[tokio::test]
    async fn autodiscovery_uses_port_offset_formula() {
        let config = DispatcherConfig::default();
        let registry = InstanceRegistry::new();
        registry.provision(&config, &[gpu(1, 48_000)]).await;
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        let mut ports: Vec<u16> = snapshot.iter().map(|i| i.port).collect();
        ports.sort();
        assert_eq!(ports, vec![11444, 11445]);
    }

    #[tokio::test]
    async fn reset_restores_health() {
        let config = DispatcherConfig::default();
        let registry = InstanceRegistry::new();
        registry.provision(&config, &[gpu(0, 8_000)]).await;
        let id = registry.snapshot()[0].id.clone();
        registry.get(&id).unwrap().mark_unhealthy_from_breaker();
        assert!(!registry.get(&id).unwrap().is_healthy());
        assert!(registry.reset(&id));
        assert!(registry.get(&id).unwrap().is_healthy());
    }
}
