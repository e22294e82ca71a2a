//! Structured logging infrastructure for the credential agent.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{CoreError, Result};

/// Initialize the logging system with human-readable output.
///
/// `RUST_LOG` takes precedence; otherwise `default_level` is used.
///
/// # Example
/// ```no_run
/// use credagent_core::logging;
///
/// logging::init("info").unwrap();
/// tracing::info!("Agent started");
/// ```
pub fn init(default_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_filter(default_level))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init()
        .map_err(|e| CoreError::Logging(e.to_string()))
}

/// Initialize the logging system with JSON output for production environments.
///
/// This format is suitable for log aggregation systems and structured log analysis.
///
/// # Example
/// ```no_run
/// use credagent_core::logging;
///
/// logging::init_json("info").unwrap();
/// tracing::info!(service = "credagent-node", "Service started");
/// ```
pub fn init_json(default_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_filter(default_level))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .try_init()
        .map_err(|e| CoreError::Logging(e.to_string()))
}

/// Initialize logging from the `[logging]` config section.
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    if config.json {
        init_json(&config.level)
    } else {
        init(&config.level)
    }
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_falls_back_to_default_level() {
        // Can only initialize once per process, so only the filter is checked here
        let filter = build_filter("debug");
        assert!(!filter.to_string().is_empty());
    }

    #[test]
    fn test_second_init_reports_error() {
        let first = init("warn");
        let second = init("warn");
        // Whichever test initialised first, the second call in this process must fail cleanly
        assert!(first.is_err() || second.is_err());
    }
}
