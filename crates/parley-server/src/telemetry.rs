//! Logging setup for Parley Server.
//!
//! Console output is pretty-printed for local development; JSON output is
//! selected with `PARLEY_LOG_JSON=1` for log shippers.
//!
//! # Configuration
//!
//! - `RUST_LOG`: Log filter (default: `info,parley_server=debug,parley_relay=debug`)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,parley_server=debug,parley_relay=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber has already been installed.
pub fn init(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = tracing_subscriber::registry().with(env_filter());

    if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true);
        registry.with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .pretty();
        registry.with(fmt_layer).try_init()?;
    }

    tracing::info!(json, "Telemetry initialized");

    Ok(())
}
