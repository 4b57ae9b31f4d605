// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structured logging setup.

use std::env;
use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::is_truthy;

/// Logging options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log safe-init internals at debug level
    pub debug: bool,
    /// Human-readable output instead of JSON lines
    pub console: bool,
}

impl LoggingConfig {
    /// Load options from the environment.
    ///
    /// - `SAFE_INIT_DEBUG` - debug level for safe-init (default: false)
    /// - `SAFE_INIT_LOGGING_USE_CONSOLE_RENDERER` - force human-readable output
    ///   (default: only when stderr is a terminal)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok(), std::io::stderr().is_terminal())
    }

    /// Load options through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F, stderr_is_terminal: bool) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).map(|v| is_truthy(&v)).unwrap_or(false);
        Self {
            debug: flag("SAFE_INIT_DEBUG"),
            console: stderr_is_terminal || flag("SAFE_INIT_LOGGING_USE_CONSOLE_RENDERER"),
        }
    }

    /// Filter directives used when `RUST_LOG` is not set.
    pub fn default_directives(&self) -> String {
        let level = if self.debug { "debug" } else { "info" };
        format!("info,safe_init={level}")
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default filter. Returns false if a global
/// subscriber was already installed, in which case nothing changes.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));

    let console = config.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
    });
    let json = (!config.console).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(json)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lookup() {
        let config = LoggingConfig::from_lookup(
            |key| (key == "SAFE_INIT_DEBUG").then(|| "true".to_string()),
            false,
        );
        assert!(config.debug);
        assert!(!config.console);
        assert_eq!(config.default_directives(), "info,safe_init=debug");
    }

    #[test]
    fn test_console_renderer() {
        let forced = LoggingConfig::from_lookup(
            |key| (key == "SAFE_INIT_LOGGING_USE_CONSOLE_RENDERER").then(|| "1".to_string()),
            false,
        );
        assert!(forced.console);

        let tty = LoggingConfig::from_lookup(|_| None, true);
        assert!(tty.console);
        assert_eq!(tty.default_directives(), "info,safe_init=info");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        // the global subscriber is already set, whoever set it
        assert!(!init_logging(&config));
    }
}
