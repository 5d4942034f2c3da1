//! Configuration management for the dispatcher
//!
//! This module handles loading, validation, and management of all dispatcher
//! configuration: the HTTP server, GPU instance topology, health/breaker
//! tuning, the response cache, and monitoring.

pub mod loader;
pub mod models;

pub use models::*;

use crate::utils::error::{DispatchError, Result};
use std::path::Path;
use tracing::{debug, info};

/// Root configuration struct for the dispatcher process.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Dispatcher (GPU instances, health, cache, retry) configuration
    pub dispatcher: DispatcherConfig,
    /// Monitoring (metrics/tracing/health path) configuration
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(?path, "loading configuration");

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DispatchError::Config(format!("failed to read config file: {e}")))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| DispatchError::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        debug!("configuration loaded successfully");
        Ok(config)
    }

    /// Load configuration from environment variables, layered over defaults.
    pub fn from_env() -> Result<Self> {
        info!("loading configuration from environment variables");
        let config = loader::from_env(Self::default())?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration.
    pub fn validate(&self) -> Result<()> {
        debug!("validating configuration");

        self.server
            .validate()
            .map_err(|e| DispatchError::Config(format!("server config error: {e}")))?;
        self.server
            .cors
            .validate()
            .map_err(|e| DispatchError::Config(format!("CORS config error: {e}")))?;
        self.dispatcher
            .validate()
            .map_err(|e| DispatchError::Config(format!("dispatcher config error: {e}")))?;

        Ok(())
    }

    /// Merge with another configuration (`other` takes precedence).
    pub fn merge(mut self, other: Self) -> Self {
        self.server = self.server.merge(other.server);
        self.dispatcher = self.dispatcher.merge(other.dispatcher);
        self.monitoring = self.monitoring.merge(other.monitoring);
        self
    }

    /// Serialize to a pretty-printed YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(DispatchError::from)
    }
}

impl serde::Serialize for Config {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(serde::Serialize)]
        struct Shadow<'a> {
            server: &'a ServerConfig,
            dispatcher: &'a DispatcherConfig,
            monitoring: &'a MonitoringConfig,
        }
        Shadow {
            server: &self.server,
            dispatcher: &self.dispatcher,
            monitoring: &self.monitoring,
        }
        .serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Config {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Shadow {
            #[serde(default)]
            server: ServerConfig,
            #[serde(default)]
            dispatcher: DispatcherConfig,
            #[serde(default)]
            monitoring: MonitoringConfig,
        }
        let shadow = Shadow::deserialize(deserializer)?;
        Ok(Config {
            server: shadow.server,
            dispatcher: shadow.dispatcher,
            monitoring: shadow.monitoring,
        })
    }
}
