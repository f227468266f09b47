//! Console logging for the entry points

use tracing_subscriber::EnvFilter;

/// Install a timestamped `fmt` subscriber, `info` unless `RUST_LOG` says otherwise
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
