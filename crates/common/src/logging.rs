//! Logging setup

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber
///
/// A non-empty `RUST_LOG` takes precedence over `default_level`. Output goes
/// to stderr, and thread names identify the per-device I/O threads
/// (`usbip-<busid>`).
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = build_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok(), default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))
}

fn build_filter(env: Option<String>, default_level: &str) -> crate::Result<EnvFilter> {
    let directives = env
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| default_level.to_string());
    EnvFilter::try_new(&directives)
        .map_err(|e| crate::Error::Config(format!("Invalid log filter '{}': {}", directives, e)))
}
