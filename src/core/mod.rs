//! Core dispatch engine: GPU discovery, instance bookkeeping, health
//! probing, scoring, the downstream provider, response caching, and the
//! Dispatcher that ties them together.

pub mod cache;
pub mod dispatcher;
pub mod gpu;
pub mod health;
pub mod instance;
pub mod provider;
pub mod scorer;
pub mod stats;
pub mod types;

pub use cache::ResponseCache;
pub use dispatcher::{Dispatcher, HealthReport};
pub use gpu::{Gpu, GpuHealth, GpuProbe, GpuVendor};
pub use health::HealthProber;
pub use instance::{Instance, InstanceRegistry};
pub use provider::Provider;
pub use scorer::Scorer;
pub use stats::{InstanceMetrics, StatsLedger};
pub use types::{FinishReason, InferenceChunk, InferenceRequest, InferenceResponse, PromptType};

use crate::config::Config;
use crate::utils::error::Result;
use std::sync::Arc;
use tracing::info;

/// Top-level service wiring: owns the Dispatcher and the background tasks
/// that keep its instance topology and health state current.
#[derive(Clone)]
pub struct DispatchService {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
}

impl DispatchService {
    pub async fn new(config: Config) -> Result<Self> {
        info!("initializing dispatch service");
        let config = Arc::new(config);
        let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone()).await);
        Ok(Self { config, dispatcher })
    }

    /// Start background health probing. Returns a handle the caller can
    /// abort on shutdown.
    pub fn run(&self) -> tokio::task::JoinHandle<()> {
        info!("starting background health probe loop");
        self.dispatcher.spawn_health_loop()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The metrics registry the Dispatcher updates internally (cache
    /// hit/miss). Callers wanting a single `/metrics` view — e.g.
    /// `AppState` — should share this handle rather than constructing a
    /// second, independent registry.
    pub fn metrics(&self) -> &Arc<crate::monitoring::DispatchMetrics> {
        self.dispatcher.metrics()
    }

    /// Re-read the dispatcher section of `path` and hot-swap it into the
    /// running Dispatcher. The server-bind/monitoring sections of `Config`
    /// are not revisited — those are process-lifetime settings applied once
    /// at startup.
    pub async fn reload_config(&self, path: &str) -> Result<()> {
        let new_config = Config::from_file(path).await?;
        self.dispatcher.reload_config(new_config.dispatcher).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_service_initializes_with_fallback_instance() {
        let mut config = Config::default();
        config.dispatcher.enable_gpu_load_balancing = false;
        let service = DispatchService::new(config).await.unwrap();
        assert_eq!(service.dispatcher().health().await.instances.len(), 1);
    }
}
