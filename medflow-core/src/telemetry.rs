//! Logging setup

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Install the global `tracing` subscriber.
///
/// The filter comes from `MEDFLOW_LOG`, then `RUST_LOG`, then `default`.
/// Only the first call has an effect, and a subscriber installed by someone
/// else is left alone.
pub fn init_logging(default: &str) {
    INIT.get_or_init(|| {
        let filter = std::env::var("MEDFLOW_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .or_else(|| EnvFilter::try_new(default).ok())
            .unwrap_or_else(|| EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
