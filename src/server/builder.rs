//! Server builder and run_server function
//!
//! This module provides the ServerBuilder for easier server configuration
//! and the run_server function for automatic configuration loading.

use crate::config::Config;
use crate::server::server::HttpServer;
use crate::utils::error::{DispatchError, Result};
use tracing::info;

/// Server builder for easier configuration
pub struct ServerBuilder {
    config: Option<Config>,
}

impl ServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        Self { config: None }
    }

    /// Set configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the HTTP server
    pub async fn build(self) -> Result<HttpServer> {
        let config = self
            .config
            .ok_or_else(|| DispatchError::Config("configuration is required".to_string()))?;

        HttpServer::new(&config).await
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the server, loading configuration from `config_path` if given and
/// falling back to environment-variable overlay on defaults otherwise.
pub async fn run_server(config_path: Option<&str>) -> Result<()> {
    info!("starting GPU inference dispatcher");

    let config = match config_path {
        Some(path) => {
            info!(path, "loading configuration file");
            Config::from_file(path).await?
        }
        None => {
            info!("no config file given, loading from environment");
            Config::from_env()?
        }
    };

    let server = HttpServer::new(&config).await?;
    info!(
        "dispatcher listening at http://{}:{}",
        config.server.host, config.server.port
    );
    info!("endpoints: GET /health, GET /metrics, POST /v1/dispatch, POST /v1/dispatch/stream, POST /v1/embeddings");

    server.start().await
}
