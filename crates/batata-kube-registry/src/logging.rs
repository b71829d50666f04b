//! Console logging setup for the registry binary

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Build the console filter: `RUST_LOG` wins, else `default_level`
pub fn console_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global tracing subscriber
///
/// Human-readable output with targets, filtered per layer like the server's
/// console layer.
pub fn init_logging(default_level: &str) -> anyhow::Result<()> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_filter(console_filter(default_level));

    Registry::default()
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::debug!(level = %default_level, "Logging initialized");
    Ok(())
}
