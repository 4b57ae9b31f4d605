// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! safe-init - invocation wrapper for serverless handlers.
//!
//! Wraps each handler invocation to:
//!
//! - **Capture failures**: returned errors and panics are reported to a crash
//!   reporter and a notification sink, then handed back to the platform
//! - **Warn before timeouts**: a deadline watchdog fires a configurable number
//!   of seconds before the platform would kill the invocation
//! - **Trace calls**: optionally records the timing and nesting of every
//!   `#[traced]` function the handler reaches
//! - **Validate results**: checks that successful values serialize to JSON and
//!   fit the platform's response limit, without changing them
//!
//! # Quick Start
//!
//! ```ignore
//! use safe_init::{SafeWrapper, StaticContext, WrapperConfig, traced};
//! use std::time::Duration;
//!
//! #[traced]
//! async fn load_order(id: u64) -> Result<Order, OrderError> {
//!     // ...
//! }
//!
//! async fn handler(event: OrderEvent, _ctx: StaticContext) -> Result<Order, OrderError> {
//!     load_order(event.order_id).await
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     safe_init::init_logging(&safe_init::LoggingConfig::from_env());
//!
//!     let wrapper = SafeWrapper::new(WrapperConfig::from_env().with_tracer(true), handler);
//!     let ctx = StaticContext::new("req-1", "orders", Duration::from_secs(30));
//!
//!     let outcome = wrapper.invoke(OrderEvent { order_id: 7 }, ctx).await;
//!     if let Some(tree) = &outcome.call_tree {
//!         println!("{}", tree.format_top_calls(10));
//!     }
//! }
//! ```
//!
//! # Deadline Watchdog
//!
//! The lead time is `SAFE_INIT_NOTIFY_SEC_BEFORE_TIMEOUT` seconds, or 5s
//! (10s for timeouts of 120s and more) when unset. The warning is reported to
//! the crash reporter, logged, and sent to the notification sink. It never
//! interrupts the handler.
//!
//! # Call Tracing
//!
//! Tracing is opt-in per invocation (`SAFE_INIT_AUTO_TRACE_LAMBDAS`) and per
//! function (`#[traced]` or [`trace_scope!`]). Frames from files matching
//! `SAFE_INIT_TRACER_HOME_PATHS` are flagged as home code. The session is
//! task-local, so concurrent invocations stay isolated.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SAFE_INIT_HANDLER` | `handler` | Handler display name |
//! | `SAFE_INIT_NOTIFY_SEC_BEFORE_TIMEOUT` | tiered | Timeout warning lead time |
//! | `SAFE_INIT_IGNORE_TIMEOUTS` | `false` | Disable the watchdog |
//! | `SAFE_INIT_AUTO_TRACE_LAMBDAS` | `false` | Enable the call tracer |
//! | `SAFE_INIT_TRACER_HOME_PATHS` | - | Comma-separated home path substrings |
//! | `SAFE_INIT_TRACER_MAX_FRAMES` | `100000` | Frame cap per invocation |
//! | `SAFE_INIT_NO_SLACK_TIMEOUT_NOTIFICATIONS` | `false` | Skip timeout notifications |
//! | `SAFE_INIT_NOTIFY_ALWAYS` | `false` | Notify on success too |
//! | `SAFE_INIT_NO_RESULT_VALIDATION` | `false` | Skip result validation |
//! | `SAFE_INIT_NO_DATADOG_WRAPPER` | `false` | Skip the agent span |
//! | `SAFE_INIT_ENV` | `unknown` | Environment name in notifications |
//! | `SAFE_INIT_SLACK_WEBHOOK_URL` | - | Chat webhook URL |
//! | `SAFE_INIT_REPORT_GRACE_MS` | `2000` | Flush time for timeout reports |
//! | `SAFE_INIT_EXTRA_ENV_VARS_FILE` | `.env.json` | JSON file overriding the variables above |

mod config;
mod context;
mod error;
mod extra_env;
mod lifecycle;
mod logging;
mod outcome;
mod panic_capture;
mod validate;
mod watchdog;
mod wrapper;

pub mod sinks;
pub mod tracer;

#[cfg(feature = "lambda")]
pub mod lambda;

// Main types
pub use config::{DEFAULT_MAX_RESPONSE_BYTES, DEFAULT_MAX_TRACE_FRAMES, WrapperConfig, is_truthy};
pub use context::{
    DeadlineSource, InvocationContext, PlatformContext, StaticContext, resolve_lead_time,
};
pub use error::{Result, SafeInitError, SinkError, TraceError};
pub use extra_env::{DEFAULT_EXTRA_ENV_FILE, EXTRA_ENV_FILE_VAR, ExtraEnv};
pub use lifecycle::{InvalidTransition, InvocationState, Lifecycle};
pub use logging::{LoggingConfig, init_logging};
pub use outcome::{Diagnostic, ErrorObject, HandlerFault, InvocationOutcome};
pub use validate::validate_result;
pub use watchdog::{FireInfo, TimeoutWarning, Watchdog, WatchdogHandle, WatchdogState};
pub use wrapper::{Handler, SafeWrapper};

// Sinks
pub use sinks::log::{LogNotifier, LogReporter, NoopNotifier};
#[cfg(feature = "slack")]
pub use sinks::slack::SlackNotifier;
pub use sinks::{
    CrashReporter, FailureReport, Notification, NotificationSink, ReportKind, Severity,
};

// Call tree
pub use tracer::{CallFrame, CallSummary, CallTree, TracingSession};

// Re-export the #[traced] macro
#[cfg(feature = "macros")]
pub use safe_init_macros::traced;

/// Trace the rest of the enclosing block as one frame.
///
/// ```ignore
/// fn reconcile(batch: &[Line]) {
///     safe_init::trace_scope!("reconcile::match_lines");
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! trace_scope {
    ($name:expr) => {
        let _safe_init_scope = $crate::tracer::enter($name, ::core::file!(), ::core::line!());
    };
}
