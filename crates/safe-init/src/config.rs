// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wrapper configuration.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::extra_env::ExtraEnv;

/// Default frame cap for a single tracing session.
pub const DEFAULT_MAX_TRACE_FRAMES: usize = 100_000;

/// Largest response the platform accepts (6 MiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 6 * 1024 * 1024;

/// Default time allowed for an in-flight timeout report to finish.
pub const DEFAULT_REPORT_GRACE_MS: u64 = 2_000;

/// Returns true for the accepted truthy spellings (`1`, `true`, `yes`, `on`, `y`).
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "y"
    )
}

/// Configuration of a [`SafeWrapper`](crate::SafeWrapper).
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    /// Display name of the wrapped handler (default: "handler")
    pub handler_name: String,
    /// Seconds before the deadline to emit the timeout warning.
    /// `None` selects the tiered default (5s, or 10s for timeouts of 120s and more).
    pub notify_sec_before_timeout: Option<u64>,
    /// Never arm the deadline watchdog (default: false)
    pub ignore_timeouts: bool,
    /// Record a call tree for every invocation (default: false)
    pub tracer_enabled: bool,
    /// Source path substrings that mark frames as "home" code
    pub tracer_home_paths: Vec<String>,
    /// Frame cap per invocation (default: 100_000)
    pub max_trace_frames: usize,
    /// Send a notification when the timeout warning fires (default: true)
    pub timeout_notifications: bool,
    /// Send a notification on successful invocations too (default: false)
    pub notify_on_success: bool,
    /// Check that successful results serialize to JSON (default: true)
    pub validate_result: bool,
    /// Maximum serialized result size (default: 6 MiB)
    pub max_response_bytes: usize,
    /// Wrap the handler in a `safe_init.invocation` span for external agents (default: true)
    pub agent_span: bool,
    /// Deployment environment shown in notifications (default: "unknown")
    pub environment: String,
    /// Incoming-webhook URL for chat notifications
    pub slack_webhook_url: Option<String>,
    /// How long to wait for an in-flight timeout report after the handler finished
    pub report_grace: Duration,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            handler_name: "handler".to_string(),
            notify_sec_before_timeout: None,
            ignore_timeouts: false,
            tracer_enabled: false,
            tracer_home_paths: Vec::new(),
            max_trace_frames: DEFAULT_MAX_TRACE_FRAMES,
            timeout_notifications: true,
            notify_on_success: false,
            validate_result: true,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            agent_span: true,
            environment: "unknown".to_string(),
            slack_webhook_url: None,
            report_grace: Duration::from_millis(DEFAULT_REPORT_GRACE_MS),
        }
    }
}

impl WrapperConfig {
    /// Create a configuration with defaults for the named handler.
    pub fn new(handler_name: impl Into<String>) -> Self {
        Self {
            handler_name: handler_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Entries of the extra env file (see [`ExtraEnv`]) take precedence over
    /// process variables.
    ///
    /// # Environment Variables
    /// - `SAFE_INIT_HANDLER` - Handler display name (default: "handler")
    /// - `SAFE_INIT_NOTIFY_SEC_BEFORE_TIMEOUT` - Lead time in seconds (default: tiered)
    /// - `SAFE_INIT_IGNORE_TIMEOUTS` - Disable the deadline watchdog (default: false)
    /// - `SAFE_INIT_AUTO_TRACE_LAMBDAS` - Enable the call tracer (default: false)
    /// - `SAFE_INIT_TRACER_HOME_PATHS` - Comma-separated home path substrings
    /// - `SAFE_INIT_TRACER_MAX_FRAMES` - Frame cap per invocation (default: 100000)
    /// - `SAFE_INIT_NO_SLACK_TIMEOUT_NOTIFICATIONS` - Skip timeout notifications (default: false)
    /// - `SAFE_INIT_NOTIFY_ALWAYS` - Notify on success too (default: false)
    /// - `SAFE_INIT_NO_RESULT_VALIDATION` - Skip result validation (default: false)
    /// - `SAFE_INIT_NO_DATADOG_WRAPPER` - Skip the agent span (default: false)
    /// - `SAFE_INIT_ENV` - Environment name (default: "unknown")
    /// - `SAFE_INIT_SLACK_WEBHOOK_URL` - Chat webhook URL
    /// - `SAFE_INIT_REPORT_GRACE_MS` - Report flush grace period (default: 2000)
    pub fn from_env() -> Self {
        let extra = ExtraEnv::from_env();
        Self::from_lookup(|key| extra.lookup(key, |k| env::var(k).ok()))
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Malformed numeric values are logged and replaced by their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |key: &str| lookup(key).map(|v| is_truthy(&v)).unwrap_or(false);

        let handler_name = lookup("SAFE_INIT_HANDLER")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.handler_name);

        let notify_sec_before_timeout =
            parse_number::<u64>(&lookup, "SAFE_INIT_NOTIFY_SEC_BEFORE_TIMEOUT").filter(|v| *v > 0);

        let tracer_home_paths = lookup("SAFE_INIT_TRACER_HOME_PATHS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let max_trace_frames = parse_number::<usize>(&lookup, "SAFE_INIT_TRACER_MAX_FRAMES")
            .unwrap_or(DEFAULT_MAX_TRACE_FRAMES);

        let report_grace = parse_number::<u64>(&lookup, "SAFE_INIT_REPORT_GRACE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.report_grace);

        Self {
            handler_name,
            notify_sec_before_timeout,
            ignore_timeouts: flag("SAFE_INIT_IGNORE_TIMEOUTS"),
            tracer_enabled: flag("SAFE_INIT_AUTO_TRACE_LAMBDAS"),
            tracer_home_paths,
            max_trace_frames,
            timeout_notifications: !flag("SAFE_INIT_NO_SLACK_TIMEOUT_NOTIFICATIONS"),
            notify_on_success: flag("SAFE_INIT_NOTIFY_ALWAYS"),
            validate_result: !flag("SAFE_INIT_NO_RESULT_VALIDATION"),
            max_response_bytes: defaults.max_response_bytes,
            agent_span: !flag("SAFE_INIT_NO_DATADOG_WRAPPER"),
            environment: lookup("SAFE_INIT_ENV")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.environment),
            slack_webhook_url: lookup("SAFE_INIT_SLACK_WEBHOOK_URL").filter(|v| !v.trim().is_empty()),
            report_grace,
        }
    }

    /// Set the lead time in seconds. Zero selects the tiered default.
    pub fn with_notify_sec_before_timeout(mut self, secs: u64) -> Self {
        self.notify_sec_before_timeout = (secs > 0).then_some(secs);
        self
    }

    /// Disable or enable the deadline watchdog.
    pub fn with_ignore_timeouts(mut self, ignore: bool) -> Self {
        self.ignore_timeouts = ignore;
        self
    }

    /// Enable or disable the call tracer.
    pub fn with_tracer(mut self, enabled: bool) -> Self {
        self.tracer_enabled = enabled;
        self
    }

    /// Set the home path substrings.
    pub fn with_home_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracer_home_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-invocation frame cap.
    pub fn with_max_trace_frames(mut self, max: usize) -> Self {
        self.max_trace_frames = max;
        self
    }

    /// Enable or disable timeout notifications.
    pub fn with_timeout_notifications(mut self, enabled: bool) -> Self {
        self.timeout_notifications = enabled;
        self
    }

    /// Notify on success as well as on failure.
    pub fn with_notify_on_success(mut self, enabled: bool) -> Self {
        self.notify_on_success = enabled;
        self
    }

    /// Enable or disable result validation.
    pub fn with_result_validation(mut self, enabled: bool) -> Self {
        self.validate_result = enabled;
        self
    }

    /// Set the maximum serialized result size.
    pub fn with_max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }

    /// Enable or disable the agent span around the handler.
    pub fn with_agent_span(mut self, enabled: bool) -> Self {
        self.agent_span = enabled;
        self
    }

    /// Set the environment name shown in notifications.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the chat webhook URL.
    pub fn with_slack_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.slack_webhook_url = Some(url.into());
        self
    }

    /// Set the grace period for in-flight timeout reports.
    pub fn with_report_grace(mut self, grace: Duration) -> Self {
        self.report_grace = grace;
        self
    }
}

fn parse_number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = raw, error = %e, "Ignoring malformed numeric setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WrapperConfig::from_lookup(|_| None);
        assert_eq!(config.handler_name, "handler");
        assert_eq!(config.notify_sec_before_timeout, None);
        assert!(!config.ignore_timeouts);
        assert!(!config.tracer_enabled);
        assert!(config.timeout_notifications);
        assert!(config.validate_result);
        assert!(config.agent_span);
        assert_eq!(config.environment, "unknown");
        assert_eq!(config.max_trace_frames, DEFAULT_MAX_TRACE_FRAMES);
        assert_eq!(config.report_grace, Duration::from_millis(2_000));
    }

    #[test]
    fn test_truthy_spellings() {
        for v in ["1", "true", "TRUE", " yes ", "on", "Y"] {
            assert!(is_truthy(v), "{v} should be truthy");
        }
        for v in ["0", "false", "no", "", "enabled"] {
            assert!(!is_truthy(v), "{v} should not be truthy");
        }
    }

    #[test]
    fn test_from_lookup_reads_all_variables() {
        let config = WrapperConfig::from_lookup(lookup_from(&[
            ("SAFE_INIT_HANDLER", "orders.handler"),
            ("SAFE_INIT_NOTIFY_SEC_BEFORE_TIMEOUT", "7"),
            ("SAFE_INIT_IGNORE_TIMEOUTS", "true"),
            ("SAFE_INIT_AUTO_TRACE_LAMBDAS", "1"),
            ("SAFE_INIT_TRACER_HOME_PATHS", "src/orders, src/billing ,"),
            ("SAFE_INIT_TRACER_MAX_FRAMES", "50"),
            ("SAFE_INIT_NO_SLACK_TIMEOUT_NOTIFICATIONS", "yes"),
            ("SAFE_INIT_NOTIFY_ALWAYS", "on"),
            ("SAFE_INIT_NO_RESULT_VALIDATION", "1"),
            ("SAFE_INIT_NO_DATADOG_WRAPPER", "1"),
            ("SAFE_INIT_ENV", "prod"),
            ("SAFE_INIT_SLACK_WEBHOOK_URL", "https://hooks.example.com/x"),
            ("SAFE_INIT_REPORT_GRACE_MS", "500"),
        ]));

        assert_eq!(config.handler_name, "orders.handler");
        assert_eq!(config.notify_sec_before_timeout, Some(7));
        assert!(config.ignore_timeouts);
        assert!(config.tracer_enabled);
        assert_eq!(config.tracer_home_paths, vec!["src/orders", "src/billing"]);
        assert_eq!(config.max_trace_frames, 50);
        assert!(!config.timeout_notifications);
        assert!(config.notify_on_success);
        assert!(!config.validate_result);
        assert!(!config.agent_span);
        assert_eq!(config.environment, "prod");
        assert_eq!(
            config.slack_webhook_url.as_deref(),
            Some("https://hooks.example.com/x")
        );
        assert_eq!(config.report_grace, Duration::from_millis(500));
    }

    #[test]
    fn test_malformed_numbers_fall_back() {
        let config = WrapperConfig::from_lookup(lookup_from(&[
            ("SAFE_INIT_NOTIFY_SEC_BEFORE_TIMEOUT", "soon"),
            ("SAFE_INIT_TRACER_MAX_FRAMES", "-3"),
        ]));
        assert_eq!(config.notify_sec_before_timeout, None);
        assert_eq!(config.max_trace_frames, DEFAULT_MAX_TRACE_FRAMES);
    }

    #[test]
    fn test_zero_lead_time_means_tiered() {
        let config =
            WrapperConfig::from_lookup(lookup_from(&[("SAFE_INIT_NOTIFY_SEC_BEFORE_TIMEOUT", "0")]));
        assert_eq!(config.notify_sec_before_timeout, None);

        let config = WrapperConfig::new("h").with_notify_sec_before_timeout(0);
        assert_eq!(config.notify_sec_before_timeout, None);
    }

    #[test]
    fn test_builder_pattern() {
        let config = WrapperConfig::new("my_handler")
            .with_notify_sec_before_timeout(3)
            .with_tracer(true)
            .with_home_paths(["src/app"])
            .with_timeout_notifications(false)
            .with_report_grace(Duration::from_millis(10));

        assert_eq!(config.handler_name, "my_handler");
        assert_eq!(config.notify_sec_before_timeout, Some(3));
        assert!(config.tracer_enabled);
        assert_eq!(config.tracer_home_paths, vec!["src/app"]);
        assert!(!config.timeout_notifications);
        assert_eq!(config.report_grace, Duration::from_millis(10));
    }
}
