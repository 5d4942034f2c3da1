//! HTTP server implementation
//!
//! This module provides the HTTP server and routing functionality.

pub mod middleware;
pub mod routes;

mod builder;
mod server;
mod state;

pub use builder::{run_server, ServerBuilder};
pub use server::HttpServer;
pub use state::AppState;
