//! Actix-web middleware: request tagging and request/response logging.

pub mod metrics;
pub mod request_id;

pub use metrics::MetricsMiddleware;
pub use request_id::RequestIdMiddleware;
