//! Structured logging initialization via `tracing-subscriber`.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence if set; otherwise `level` (the CLI's
/// `--log-level`) becomes the default filter. Switches to JSON output when
/// `json` is true (intended for production deployments behind a log
/// aggregator).
pub fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
