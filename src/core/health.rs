//! Background and emergency health probing.
//!
//! Two probing modes share one code path: a periodic fan-out that runs every
//! `healthCheckIntervalSec` and updates instance state without blocking the
//! Dispatcher, and a synchronous "emergency" probe the Dispatcher calls
//! inline when it has no healthy candidate left. The emergency probe is
//! itself time-coalesced behind a single TTL field so a burst of
//! simultaneously-starved callers only pays for one round trip.

use crate::core::instance::InstanceRegistry;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Periodic and emergency liveness probing for all instances in a registry.
pub struct HealthProber {
    registry: Arc<InstanceRegistry>,
    client: Client,
    interval: Duration,
    /// When the last emergency probe completed; guards single-flight
    /// coalescing within `health_check_cache_duration`.
    last_emergency_probe: Mutex<Option<Instant>>,
    health_check_cache_duration: Duration,
}

impl HealthProber {
    pub fn new(registry: Arc<InstanceRegistry>, health_check_interval_sec: u64) -> Self {
        Self {
            registry,
            client: Client::new(),
            interval: Duration::from_secs(health_check_interval_sec),
            last_emergency_probe: Mutex::new(None),
            health_check_cache_duration: Duration::from_secs(health_check_interval_sec),
        }
    }

    /// Run the periodic probe loop until cancelled. Intended to be spawned
    /// as its own task; probes fan out concurrently and never block dispatch.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            self.probe_all().await;
        }
    }

    /// Probe every known instance concurrently, updating health state.
    pub async fn probe_all(&self) {
        let instances = self.registry.snapshot();
        let probes = instances.iter().map(|instance| {
            let client = self.client.clone();
            let instance = instance.clone();
            async move {
                let healthy = Self::probe_one(&client, &instance.base_url).await;
                instance.mark_probe_result(healthy);
            }
        });
        futures::future::join_all(probes).await;
    }

    /// Synchronous single-flight probe used when the Dispatcher has run out
    /// of healthy candidates. Concurrent callers within
    /// `health_check_cache_duration` of the last probe share its result
    /// instead of each issuing their own round trip.
    pub async fn emergency_probe(&self) {
        let mut guard = self.last_emergency_probe.lock().await;
        if let Some(last) = *guard {
            if last.elapsed() < self.health_check_cache_duration {
                debug!("emergency probe coalesced with a recent probe");
                return;
            }
        }
        info!("running emergency health probe: no healthy instance available");
        self.probe_all().await;
        *guard = Some(Instant::now());
    }

    async fn probe_one(client: &Client, base_url: &str) -> bool {
        let request = client.get(format!("{base_url}/tags")).send();
        match timeout(PROBE_TIMEOUT, request).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn probe_marks_reachable_instance_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tags"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let registry = Arc::new(InstanceRegistry::new());
        let mut config = DispatcherConfig::default();
        config.enable_gpu_load_balancing = false;
        registry.provision(&config, &[]).await;
        let instance = registry.snapshot().into_iter().next().unwrap();
        // Point the provisioned instance at the mock server for this test.
        let prober = HealthProber::new(registry.clone(), 30);
        let healthy = HealthProber::probe_one(&prober.client, &server.uri()).await;
        assert!(healthy);
        instance.mark_probe_result(healthy);
        assert!(instance.is_healthy());
    }

    #[tokio::test]
    async fn emergency_probe_is_coalesced_within_cache_duration() {
        let registry = Arc::new(InstanceRegistry::new());
        let prober = HealthProber::new(registry, 3600);
        prober.emergency_probe().await;
        let first = *prober.last_emergency_probe.lock().await;
        prober.emergency_probe().await;
        let second = *prober.last_emergency_probe.lock().await;
        assert_eq!(first, second);
    }
}
