//! Tracing setup.
//!
//! `RUST_LOG` takes precedence over the configured level. Output is
//! human-readable by default, or JSON lines when `logging.json` is set.

use crate::config::LoggingConfig;
use crate::error::MetricError;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed or the level is not a valid
/// filter directive.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), MetricError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| MetricError::Config(format!("tracing already initialized: {}", e)))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, MetricError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            MetricError::Config(format!("invalid log level '{}': {}", config.level, e))
        }),
    }
}
