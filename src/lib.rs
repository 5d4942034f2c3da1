//! # dispatcher
//!
//! A multi-instance AI inference load balancer: discovers local GPU
//! accelerators, provisions one or more model-server instances per GPU,
//! routes requests across them by a health- and latency-aware score, and
//! fails over between instances on transient downstream failure.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dispatcher::server::HttpServer;
//! use dispatcher::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config/dispatcher.yaml").await?;
//!     let server = HttpServer::new(&config).await?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod config;
pub mod core;
pub mod monitoring;
pub mod server;
pub mod utils;

pub use config::Config;
pub use core::DispatchService;
pub use utils::error::{DispatchError, Result};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Name of the crate
pub const NAME: &str = env!("CARGO_PKG_NAME");
/// Description of the crate
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_match_cargo_metadata() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
        assert_eq!(NAME, env!("CARGO_PKG_NAME"));
        assert_eq!(DESCRIPTION, env!("CARGO_PKG_DESCRIPTION"));
    }
}
