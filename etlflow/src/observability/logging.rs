//! Subscriber installation.
//!
//! Library code only emits `tracing` events; binaries and tests call
//! [`init_logging`] once to route them somewhere.

use crate::config::LogConfig;
use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable read before `RUST_LOG`.
pub const LOG_ENV: &str = "ETLFLOW_LOG";

/// Builds the filter: `ETLFLOW_LOG`, then `RUST_LOG`, then
/// `etlflow=<level>`.
///
/// # Errors
///
/// Returns an error for an unparseable directive.
pub fn build_filter(config: &LogConfig) -> anyhow::Result<EnvFilter> {
    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .unwrap_or_else(|_| format!("etlflow={}", config.level));
    EnvFilter::try_new(&directives).with_context(|| format!("Invalid log filter '{directives}'"))
}

/// Installs the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed.
///
/// # Errors
///
/// Returns an error for an unparseable filter.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<bool> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    Ok(installed.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_builds() {
        let config = LogConfig::default();
        assert!(build_filter(&config).is_ok());
    }

    #[test]
    fn test_second_install_is_not_an_error() {
        let config = LogConfig::default();
        let _ = init_logging(&config).unwrap();
        assert!(!init_logging(&config).unwrap());
    }
}
