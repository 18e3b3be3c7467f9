//! Tracing subscriber setup
//!
//! The library only emits `tracing` events; embedding applications call
//! [`init`] once if they want keygraph to install the global subscriber.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{KeygraphError, KeygraphResult};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` when set, otherwise the configured directive
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter))
}

/// Install the global tracing subscriber
///
/// Fails with [`KeygraphError::Logging`] if a subscriber is already set.
pub fn init(config: &LoggingConfig) -> KeygraphResult<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(config.with_target);

    let result = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| KeygraphError::Logging(e.to_string()))
}
