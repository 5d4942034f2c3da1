//! GPU discovery: enumerate local accelerators and their capability by
//! shelling out to vendor tools and parsing tabular output.
//!
//! Mirrors the atomics-and-short-critical-section style used by
//! [`crate::core::instance::Instance`], but the state here is a single
//! time-coalesced cache entry rather than per-instance counters: concurrent
//! callers during a refresh share one in-flight probe instead of each
//! kicking off their own `nvidia-smi` invocation.

use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Accelerator vendor as reported by the probe tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Other,
}

/// A single physical accelerator, as discovered by a probe cycle.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Gpu {
    pub id: u32,
    pub vendor: GpuVendor,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
    pub compute_tier: u32,
    pub supports_fp16: bool,
    pub supports_bf16: bool,
}

impl Gpu {
    /// How many local instances this GPU can reasonably host, used by
    /// `InstanceRegistry::provision` when no explicit instance list is given.
    pub fn recommended_instance_count(&self) -> u32 {
        match self.memory_total_mb {
            mb if mb >= 24_000 => 2,
            mb if mb >= 4_000 => 1,
            _ => 0,
        }
    }

    /// Tiered model-capability catalog, keyed off total memory.
    pub fn recommended_models(&self) -> Vec<String> {
        let mut models = Vec::new();
        if self.memory_total_mb >= 4_000 {
            models.push("7b-q4".to_string());
        }
        if self.memory_total_mb >= 8_000 {
            models.push("7b".to_string());
            models.push("codegemma".to_string());
        }
        if self.memory_total_mb >= 12_000 {
            models.push("9b".to_string());
        }
        if self.memory_total_mb >= 24_000 {
            models.push("mixtral".to_string());
            models.push("34b".to_string());
        }
        models
    }
}

/// Point-in-time health reading for one GPU.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GpuHealth {
    pub temperature_c: f32,
    pub gpu_util_pct: f32,
    pub mem_util_pct: f32,
    pub mem_used_mb: u64,
    pub mem_total_mb: u64,
    pub power_draw_w: f32,
    pub healthy: bool,
}

impl GpuHealth {
    fn new(
        temperature_c: f32,
        gpu_util_pct: f32,
        mem_used_mb: u64,
        mem_total_mb: u64,
        power_draw_w: f32,
    ) -> Self {
        let mem_util_pct = if mem_total_mb > 0 {
            (mem_used_mb as f32 / mem_total_mb as f32) * 100.0
        } else {
            0.0
        };
        Self {
            temperature_c,
            gpu_util_pct,
            mem_util_pct,
            mem_used_mb,
            mem_total_mb,
            power_draw_w,
            healthy: temperature_c < 85.0 && mem_util_pct < 95.0,
        }
    }
}

const ENUMERATE_CACHE_TTL: Duration = Duration::from_secs(300);

struct EnumerateCache {
    at: Instant,
    gpus: Vec<Gpu>,
}

/// Probes local accelerators via `nvidia-smi` (with a `rocm-smi` fallback).
pub struct GpuProbe {
    cache: Mutex<Option<EnumerateCache>>,
}

impl Default for GpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuProbe {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }

    /// Enumerate local GPUs, serving a 5-minute cache shared by all callers.
    pub async fn enumerate(&self) -> Vec<Gpu> {
        let mut guard = self.cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.at.elapsed() < ENUMERATE_CACHE_TTL {
                return cached.gpus.clone();
            }
        }

        let gpus = Self::probe_nvidia().await;
        let gpus = if gpus.is_empty() {
            Self::probe_rocm().await
        } else {
            gpus
        };

        *guard = Some(EnumerateCache {
            at: Instant::now(),
            gpus: gpus.clone(),
        });
        gpus
    }

    /// Invalidate the enumeration cache, forcing the next call to re-probe.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Point-in-time health snapshot for a single GPU by index.
    pub async fn health_snapshot(&self, gpu_id: u32) -> Option<GpuHealth> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,temperature.gpu,utilization.gpu,memory.used,memory.total,power.draw",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines() {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 6 {
                continue;
            }
            if fields[0].parse::<u32>().ok()? != gpu_id {
                continue;
            }
            let temperature_c = fields[1].parse().ok()?;
            let gpu_util_pct = fields[2].parse().ok()?;
            let mem_used_mb = fields[3].parse().ok()?;
            let mem_total_mb = fields[4].parse().ok()?;
            let power_draw_w = fields[5].parse().unwrap_or(0.0);
            return Some(GpuHealth::new(
                temperature_c,
                gpu_util_pct,
                mem_used_mb,
                mem_total_mb,
                power_draw_w,
            ));
        }
        None
    }

    async fn probe_nvidia() -> Vec<Gpu> {
        let output = match Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,name,memory.total,memory.free,compute_cap",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!(status = ?output.status, "nvidia-smi exited non-zero");
                return Vec::new();
            }
            Err(e) => {
                debug!(error = %e, "nvidia-smi not available");
                return Vec::new();
            }
        };

        let text = String::from_utf8_lossy(&output.stdout);
        let mut gpus = Vec::new();
        for line in text.lines() {
            match Self::parse_nvidia_row(line) {
                Some(gpu) => gpus.push(gpu),
                None => warn!(row = line, "skipping malformed nvidia-smi row"),
            }
        }
        gpus
    }

    fn parse_nvidia_row(line: &str) -> Option<Gpu> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 5 {
            return None;
        }
        let id = fields[0].parse().ok()?;
        let name = fields[1].to_string();
        let memory_total_mb = fields[2].parse().ok()?;
        let memory_free_mb = fields[3].parse().ok()?;
        let compute_cap: f32 = fields[4].parse().ok()?;
        let compute_tier = (compute_cap * 10.0).round() as u32;
        Some(Gpu {
            id,
            vendor: GpuVendor::Nvidia,
            name,
            memory_total_mb,
            memory_free_mb,
            compute_tier,
            supports_fp16: compute_cap >= 6.0,
            supports_bf16: compute_cap >= 8.0,
        })
    }

    async fn probe_rocm() -> Vec<Gpu> {
        // rocm-smi's tabular output differs in column layout from nvidia-smi;
        // absence of the tool (the common case on an all-NVIDIA box) yields
        // an empty list rather than an error per the GpuProbe contract.
        match Command::new("rocm-smi").arg("--showproductname").output().await {
            Ok(output) if output.status.success() => {
                debug!("rocm-smi present but AMD enumeration is not yet implemented");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_row() {
        let gpu = GpuProbe::parse_nvidia_row("0, NVIDIA GeForce RTX 4090, 24564, 23000, 8.9").unwrap();
        assert_eq!(gpu.id, 0);
        assert_eq!(gpu.memory_total_mb, 24564);
        assert!(gpu.supports_bf16);
    }

    #[test]
    fn rejects_short_row() {
        assert!(GpuProbe::parse_nvidia_row("0, incomplete").is_none());
    }

    #[test]
    fn recommended_instance_count_tiers() {
        let small = Gpu {
            id: 0,
            vendor: GpuVendor::Nvidia,
            name: "small".into(),
            memory_total_mb: 6_000,
            memory_free_mb: 6_000,
            compute_tier: 75,
            supports_fp16: true,
            supports_bf16: false,
        };
        assert_eq!(small.recommended_instance_count(), 1);

        let big = Gpu {
            memory_total_mb: 48_000,
            ..small
        };
        assert_eq!(big.recommended_instance_count(), 2);
        assert!(big.recommended_models().contains(&"mixtral".to_string()));
    }

    #[tokio::test]
    async fn enumerate_without_tooling_returns_empty_not_error() {
        // On a CI box without nvidia-smi/rocm-smi this must not panic or error.
        let probe = GpuProbe::new();
        let _ = probe.enumerate().await;
    }
}
