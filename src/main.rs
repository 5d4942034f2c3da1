//! GPU inference dispatcher — entry point.
//!
//! Fronts a fleet of local GPU-backed model-server processes, routing
//! requests across them by a health- and latency-aware score.

#![allow(missing_docs)]

use clap::Parser;
use dispatcher::core::GpuProbe;
use dispatcher::server::run_server;
use dispatcher::utils::logging::init_tracing;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "dispatcher", version, about = "Multi-instance AI inference dispatcher")]
struct Cli {
    /// Path to a YAML configuration file. Falls back to environment
    /// variable overrides on defaults when omitted.
    #[arg(long)]
    config: Option<String>,

    /// Enumerate local GPUs, print the result, and exit without starting
    /// the HTTP server. Useful for validating the host before deployment.
    #[arg(long)]
    gpu_probe_only: bool,

    /// Default tracing filter level, overridden by `RUST_LOG` when set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON instead of the default human-readable format.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Best-effort: a missing .env file is the common case outside local dev.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    if cli.gpu_probe_only {
        let probe = GpuProbe::new();
        let gpus = probe.enumerate().await;
        if gpus.is_empty() {
            info!("no GPUs detected");
        }
        for gpu in &gpus {
            info!(
                id = gpu.id,
                vendor = ?gpu.vendor,
                memory_mb = gpu.memory_total_mb,
                "detected GPU"
            );
        }
        match serde_json::to_string_pretty(&gpus) {
            Ok(json) => println!("{json}"),
            Err(e) => error!(error = %e, "failed to serialize GPU list"),
        }
        return ExitCode::SUCCESS;
    }

    match run_server(cli.config.as_deref()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
