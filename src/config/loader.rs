//! Environment-variable configuration overlay.
//!
//! Mirrors the YAML shape with `DISPATCHER_`-prefixed env vars, so a
//! deployment can run entirely off environment configuration (containers)
//! without a mounted config file.

use super::Config;
use crate::utils::error::{DispatchError, Result};
use std::env;

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map(Some)
            .map_err(|e| DispatchError::Config(format!("invalid value for {key}: {e}"))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(DispatchError::Config(format!("invalid env var {key}: {e}"))),
    }
}

/// Apply `DISPATCHER_*` environment overrides on top of `base`.
pub fn from_env(mut base: Config) -> Result<Config> {
    if let Ok(host) = env::var("DISPATCHER_HOST") {
        base.server.host = host;
    }
    if let Some(port) = parse_env::<u16>("DISPATCHER_PORT")? {
        base.server.port = port;
    }
    if let Some(enabled) = parse_env::<bool>("DISPATCHER_GPU_LOAD_BALANCING")? {
        base.dispatcher.enable_gpu_load_balancing = enabled;
    }
    if let Some(interval) = parse_env::<u64>("DISPATCHER_HEALTH_CHECK_INTERVAL_SEC")? {
        base.dispatcher.health_check_interval_sec = interval;
    }
    if let Some(threshold) = parse_env::<f64>("DISPATCHER_ERROR_RATE_THRESHOLD")? {
        base.dispatcher.error_rate_threshold = threshold;
    }
    if let Some(max_retries) = parse_env::<u32>("DISPATCHER_MAX_RETRIES")? {
        base.dispatcher.max_retries = max_retries;
    }
    if let Some(ttl) = parse_env::<u64>("DISPATCHER_CACHE_TTL_MINUTES")? {
        base.dispatcher.cache.ttl_minutes = ttl;
    }
    if let Some(max_entries) = parse_env::<usize>("DISPATCHER_CACHE_MAX_ENTRIES")? {
        base.dispatcher.cache.max_entries = max_entries;
    }
    // GPU instance topology is expressed as comma-separated gpu_id:port pairs,
    // e.g. "0:9001,1:9002" — the YAML file is the richer source for per-instance weights.
    if let Ok(instances) = env::var("DISPATCHER_GPU_INSTANCES") {
        let mut parsed = Vec::new();
        for pair in instances.split(',').filter(|s| !s.is_empty()) {
            let (gpu, port) = pair.split_once(':').ok_or_else(|| {
                DispatchError::Config(format!("invalid DISPATCHER_GPU_INSTANCES entry: {pair}"))
            })?;
            parsed.push(super::GpuInstanceConfig {
                gpu_id: gpu
                    .parse()
                    .map_err(|e| DispatchError::Config(format!("invalid gpu_id in {pair}: {e}")))?,
                port: port
                    .parse()
                    .map_err(|e| DispatchError::Config(format!("invalid port in {pair}: {e}")))?,
                weight: 1.0,
            });
        }
        base.dispatcher.gpu_instances = parsed;
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpu_instances_from_env() {
        // SAFETY: test runs single-threaded within this process for this var.
        unsafe {
            env::set_var("DISPATCHER_GPU_INSTANCES", "0:9001,1:9002");
        }
        let config = from_env(Config::default()).unwrap();
        assert_eq!(config.dispatcher.gpu_instances.len(), 2);
        assert_eq!(config.dispatcher.gpu_instances[1].gpu_id, 1);
        unsafe {
            env::remove_var("DISPATCHER_GPU_INSTANCES");
        }
    }
}
