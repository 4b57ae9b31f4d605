// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Platform context abstraction and per-invocation context.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::WrapperConfig;

/// Lead time used for timeouts shorter than [`LONG_TIMEOUT_SECS`].
pub const SHORT_TIMEOUT_LEAD_SECS: u64 = 5;

/// Lead time used for timeouts of [`LONG_TIMEOUT_SECS`] and more.
pub const LONG_TIMEOUT_LEAD_SECS: u64 = 10;

/// Threshold between the short and long lead-time tiers.
pub const LONG_TIMEOUT_SECS: u64 = 120;

/// Source of the time remaining before the platform terminates an invocation.
pub trait DeadlineSource {
    /// Milliseconds left before forced termination. May be negative once the
    /// deadline has passed.
    fn remaining_millis(&self) -> i64;
}

/// Host-provided invocation context.
pub trait PlatformContext: DeadlineSource + Send + Sync {
    /// Platform request identifier.
    fn invocation_id(&self) -> &str;

    /// Name of the deployed function.
    fn function_name(&self) -> &str;
}

/// A context with a fixed deadline, for local runs and tests.
#[derive(Debug, Clone)]
pub struct StaticContext {
    invocation_id: String,
    function_name: String,
    deadline: Instant,
}

impl StaticContext {
    /// Create a context whose deadline is `remaining` from now.
    pub fn new(
        invocation_id: impl Into<String>,
        function_name: impl Into<String>,
        remaining: Duration,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            function_name: function_name.into(),
            deadline: Instant::now() + remaining,
        }
    }
}

impl DeadlineSource for StaticContext {
    fn remaining_millis(&self) -> i64 {
        let now = Instant::now();
        if now >= self.deadline {
            -i64::try_from(now.duration_since(self.deadline).as_millis()).unwrap_or(i64::MAX)
        } else {
            i64::try_from(self.deadline.duration_since(now).as_millis()).unwrap_or(i64::MAX)
        }
    }
}

impl PlatformContext for StaticContext {
    fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    fn function_name(&self) -> &str {
        &self.function_name
    }
}

/// Resolve the lead time for an invocation.
///
/// A configured value above zero wins. Otherwise the lead time is 5s, or 10s
/// when the whole timeout (rounded to seconds) is 120s or more.
pub fn resolve_lead_time(configured_secs: Option<u64>, remaining_millis: i64) -> Duration {
    if let Some(secs) = configured_secs.filter(|s| *s > 0) {
        return Duration::from_secs(secs);
    }
    if timeout_secs(remaining_millis) < LONG_TIMEOUT_SECS {
        Duration::from_secs(SHORT_TIMEOUT_LEAD_SECS)
    } else {
        Duration::from_secs(LONG_TIMEOUT_LEAD_SECS)
    }
}

fn timeout_secs(remaining_millis: i64) -> u64 {
    let millis = u64::try_from(remaining_millis.max(0)).unwrap_or(0);
    (millis + 500) / 1000
}

/// Everything the wrapper knows about one invocation.
///
/// Created when the invocation starts and dropped when it has been reported.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub invocation_id: String,
    pub function_name: String,
    pub handler_name: String,
    /// Remaining time reported by the platform when the invocation started
    pub initial_remaining_ms: i64,
    pub lead_time: Duration,
    pub tracer_enabled: bool,
    pub home_paths: Arc<[String]>,
    pub max_frames: usize,
    pub started_at: Instant,
}

impl InvocationContext {
    /// Capture the context of an invocation that starts now.
    pub fn new<C: PlatformContext + ?Sized>(ctx: &C, config: &WrapperConfig) -> Self {
        let initial_remaining_ms = ctx.remaining_millis();
        Self {
            invocation_id: ctx.invocation_id().to_string(),
            function_name: ctx.function_name().to_string(),
            handler_name: config.handler_name.clone(),
            initial_remaining_ms,
            lead_time: resolve_lead_time(config.notify_sec_before_timeout, initial_remaining_ms),
            tracer_enabled: config.tracer_enabled,
            home_paths: config.tracer_home_paths.clone().into(),
            max_frames: config.max_trace_frames,
            started_at: Instant::now(),
        }
    }

    /// Whole-invocation timeout in seconds, rounded.
    pub fn configured_timeout_secs(&self) -> u64 {
        timeout_secs(self.initial_remaining_ms)
    }

    /// Time since the invocation started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
