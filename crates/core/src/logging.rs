//! Structured logging infrastructure for Lifeline.
//!
//! Centralized logging initialization with support for structured JSON
//! output (for log collection off a field device) and environment-based
//! filtering.

use crate::config::LogFormat;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system with human-readable output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use lifeline_core::logging;
///
/// logging::init();
/// tracing::info!("Node started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize the logging system with JSON output.
///
/// # Example
/// ```no_run
/// use lifeline_core::logging;
///
/// logging::init_json();
/// tracing::info!(peer_id = "a1b2c3d4", "Courier started");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize logging in the format selected by configuration.
pub fn init_with(format: LogFormat) {
    match format {
        LogFormat::Pretty => init(),
        LogFormat::Json => init_json(),
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
