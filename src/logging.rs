//! Tracing subscriber setup for the plugin binary.
//!
//! Stdout carries the CNI protocol, so logs go to stderr, or are appended
//! to the configured `logFile`. The level comes from `logLevel` in the
//! network configuration; an `IB_SRIOV_CNI_LOG` directive overrides it.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::constants::{DEFAULT_LOG_LEVEL, LOG_ENV};
use crate::error::{Error, Result};

/// Picks the filter directive: environment first, then `logLevel`, then
/// the default.
pub fn filter_directive(env: Option<&str>, log_level: Option<&str>) -> String {
    env.filter(|d| !d.trim().is_empty())
        .or(log_level.filter(|l| !l.trim().is_empty()))
        .unwrap_or(DEFAULT_LOG_LEVEL)
        .to_string()
}

fn build_filter(log_level: Option<&str>) -> EnvFilter {
    let env = std::env::var(LOG_ENV).ok();
    let directive = filter_directive(env.as_deref(), log_level);
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

/// Installs the global subscriber.
///
/// Fails if `log_file` cannot be opened or a subscriber is already set.
pub fn init(log_level: Option<&str>, log_file: Option<&Path>) -> Result<()> {
    let registry = tracing_subscriber::registry().with(build_filter(log_level));

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false)
                        .with_target(true),
                )
                .try_init()
        }
        None => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("failed to install log subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides_config_level() {
        assert_eq!(filter_directive(Some("debug"), Some("warn")), "debug");
        assert_eq!(filter_directive(None, Some("warn")), "warn");
        assert_eq!(filter_directive(Some(" "), None), DEFAULT_LOG_LEVEL);
        assert_eq!(filter_directive(None, Some("")), DEFAULT_LOG_LEVEL);
    }
}
