//! Error types for the dispatcher

use thiserror::Error;

/// Result type alias for the dispatcher
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Main error type for the dispatcher.
///
/// The first seven variants are the taxonomy surfaced to callers of
/// `Dispatcher::dispatch`/`dispatch_stream`; the rest are ambient plumbing
/// errors (config loading, serialization) that never escape a request path.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Malformed or out-of-range request (bad model id, empty prompt, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// No instance was healthy (or present) to serve the request.
    #[error("no healthy instance available for model {model}")]
    NoHealthyInstance {
        /// Requested model id.
        model: String,
    },

    /// A retryable downstream failure (connection reset, 503, timeout while
    /// still within budget). Callers may retry on a different instance.
    #[error("transient error on instance {instance_id}: {message}")]
    Transient {
        /// Instance that produced the error.
        instance_id: String,
        /// Human-readable detail.
        message: String,
    },

    /// A non-retryable error surfaced by the downstream model server itself
    /// (e.g. HTTP 400/404 from its `/generate` endpoint).
    #[error("downstream error on instance {instance_id} ({status}): {message}")]
    Downstream {
        /// Instance that produced the error.
        instance_id: String,
        /// HTTP status code returned by the downstream server.
        status: u16,
        /// Response body or error detail.
        message: String,
    },

    /// The request exceeded its deadline before a response was produced.
    #[error("request timed out after {elapsed_ms}ms")]
    Timeout {
        /// Elapsed time in milliseconds when the timeout fired.
        elapsed_ms: u64,
    },

    /// The downstream response body could not be parsed as the expected
    /// wire format.
    #[error("failed to parse downstream response: {0}")]
    ParseError(String),

    /// The request was cancelled by its caller before completion.
    #[error("request cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Not found errors (admin routes)
    #[error("not found: {0}")]
    NotFound(String),
}

impl DispatchError {
    /// Whether a single downstream call is worth retrying on the *same*
    /// instance (Provider's own retry-with-backoff loop). Only network
    /// errors and 5xx/429 responses qualify; a deadline that has already
    /// elapsed is not worth spending more of the caller's budget on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Transient { .. })
    }

    /// Whether the Dispatcher should try a *different* instance after this
    /// error (§4.E steps 8-9): a downstream failure (including a transient
    /// one whose same-instance retries are exhausted, and a malformed
    /// response) may fail over; a timeout or a request-shaped validation
    /// error must not.
    pub fn triggers_failover(&self) -> bool {
        matches!(
            self,
            DispatchError::Transient { .. } | DispatchError::Downstream { .. } | DispatchError::ParseError(_)
        )
    }

    /// HTTP status code this error should be mapped to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            DispatchError::Validation(_) => 400,
            DispatchError::NoHealthyInstance { .. } => 503,
            DispatchError::Transient { .. } => 502,
            DispatchError::Downstream { status, .. } => *status,
            DispatchError::Timeout { .. } => 504,
            DispatchError::ParseError(_) => 502,
            DispatchError::Cancelled => 499,
            DispatchError::NotFound(_) => 404,
            DispatchError::Config(_)
            | DispatchError::HttpClient(_)
            | DispatchError::Serialization(_)
            | DispatchError::Yaml(_)
            | DispatchError::Io(_) => 500,
        }
    }
}
