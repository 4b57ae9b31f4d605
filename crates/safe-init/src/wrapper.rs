// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution wrapper.
//!
//! Runs one handler invocation end to end:
//! 1. Capture the invocation context and arm the deadline watchdog
//! 2. Run the handler inside the tracing session (if enabled) and the agent span
//! 3. Cancel the watchdog and finalize the call tree
//! 4. Classify the result, validate successful values
//! 5. Report faults, soft failures and timeout warnings to the sinks
//!
//! Sink failures never change what the handler produced.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use serde::Serialize;
use tracing::{Instrument, Span, debug, error, info_span, warn};

use crate::config::WrapperConfig;
use crate::context::{InvocationContext, PlatformContext};
use crate::error::SinkError;
use crate::lifecycle::{InvocationState, Lifecycle};
use crate::outcome::{Diagnostic, ErrorObject, HandlerFault, InvocationOutcome};
use crate::panic_capture::catch_panic;
use crate::sinks::log::{LogNotifier, LogReporter};
use crate::sinks::{
    CrashReporter, FailureReport, Notification, NotificationSink, ReportKind, Severity,
};
use crate::tracer::{CallTree, TracingSession};
use crate::validate::validate_result;
use crate::watchdog::{FireInfo, TimeoutWarning, Watchdog, WatchdogState};

/// Number of slowest calls shown in notifications.
const NOTIFIED_TOP_CALLS: usize = 15;

/// An async invocation handler.
///
/// Implemented for every `Fn(E, C) -> impl Future<Output = Result<T, Err>>`.
pub trait Handler<E, C>: Send + Sync {
    type Output;
    type Error;
    type Future: Future<Output = Result<Self::Output, Self::Error>>;

    fn call(&self, event: E, ctx: C) -> Self::Future;
}

impl<F, Fut, E, C, T, Err> Handler<E, C> for F
where
    F: Fn(E, C) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, Err>>,
{
    type Output = T;
    type Error = Err;
    type Future = Fut;

    fn call(&self, event: E, ctx: C) -> Fut {
        self(event, ctx)
    }
}

/// Wraps a handler with failure capture, timeout warnings and call tracing.
///
/// The wrapper holds no per-invocation state; one instance can serve any
/// number of sequential or concurrent invocations.
///
/// # Example
///
/// ```ignore
/// use safe_init::{SafeWrapper, StaticContext, WrapperConfig};
/// use std::time::Duration;
///
/// async fn handler(event: serde_json::Value, _ctx: StaticContext) -> Result<String, std::io::Error> {
///     Ok(format!("got {event}"))
/// }
///
/// let wrapper = SafeWrapper::new(WrapperConfig::from_env(), handler);
/// let ctx = StaticContext::new("req-1", "my-function", Duration::from_secs(30));
/// let value = wrapper.run(serde_json::json!({"id": 1}), ctx).await?;
/// ```
pub struct SafeWrapper<H> {
    config: Arc<WrapperConfig>,
    handler: H,
    reporter: Arc<dyn CrashReporter>,
    notifier: Arc<dyn NotificationSink>,
}

impl<H> SafeWrapper<H> {
    /// Wrap `handler` with the given configuration.
    ///
    /// Reports go to the log. Notifications go to the chat webhook when one is
    /// configured (feature `slack`), to the log otherwise.
    pub fn new(config: WrapperConfig, handler: H) -> Self {
        let notifier = default_notifier(&config);
        Self {
            config: Arc::new(config),
            handler,
            reporter: Arc::new(LogReporter),
            notifier,
        }
    }

    /// Wrap `handler` with configuration read from the environment.
    pub fn from_env(handler: H) -> Self {
        Self::new(WrapperConfig::from_env(), handler)
    }

    /// Replace the crash reporter.
    pub fn with_crash_reporter(mut self, reporter: impl CrashReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Replace the notification sink.
    pub fn with_notification_sink(mut self, notifier: impl NotificationSink + 'static) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    /// Run one invocation and return its full outcome.
    pub async fn invoke<E, C>(&self, event: E, ctx: C) -> InvocationOutcome<H::Output, H::Error>
    where
        H: Handler<E, C>,
        H::Output: Serialize,
        H::Error: fmt::Display + fmt::Debug,
        C: PlatformContext,
    {
        let mut lifecycle = Lifecycle::new();
        let inv = Arc::new(InvocationContext::new(&ctx, &self.config));
        advance(&mut lifecycle, InvocationState::Running, &inv);

        debug!(
            invocation_id = %inv.invocation_id,
            remaining_ms = inv.initial_remaining_ms,
            lead_time_s = inv.lead_time.as_secs(),
            tracer = inv.tracer_enabled,
            "Invocation started"
        );

        let session = inv.tracer_enabled.then(|| TracingSession::activate(&inv));
        let timeout_diagnostics = Arc::new(Mutex::new(Vec::new()));

        let mut watchdog = if self.config.ignore_timeouts {
            None
        } else {
            let reporter = self.reporter.clone();
            let notifier = self.notifier.clone();
            let notify = self.config.timeout_notifications;
            let inv = inv.clone();
            let session = session.clone();
            let diagnostics = timeout_diagnostics.clone();
            Some(Watchdog::arm(
                inv.initial_remaining_ms,
                inv.lead_time,
                move |info| async move {
                    let found = report_timeout(
                        reporter.as_ref(),
                        notifier.as_ref(),
                        notify,
                        &inv,
                        session.as_ref(),
                        info,
                    )
                    .await;
                    diagnostics
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend(found);
                },
            ))
        };

        let span = if self.config.agent_span {
            info_span!(
                "safe_init.invocation",
                invocation_id = %inv.invocation_id,
                function_name = %inv.function_name,
                handler = %inv.handler_name,
            )
        } else {
            Span::none()
        };

        let handler_session = session.clone();
        let run_handler = async move {
            let handler_future = async move { self.handler.call(event, ctx).await };
            match handler_session {
                Some(session) => session.scope(handler_future).await,
                None => handler_future.await,
            }
        };
        let raw = catch_panic(run_handler.instrument(span)).await;

        let timeout_warning_fired = match &watchdog {
            Some(handle) => handle.cancel() == WatchdogState::Fired,
            None => false,
        };
        let call_tree = session.as_ref().and_then(|s| match s.finalize() {
            Ok(tree) => Some(tree),
            Err(e) => {
                warn!(error = %e, "Call tree unavailable");
                None
            }
        });

        let mut diagnostics = Vec::new();
        let result = match raw {
            Ok(Ok(value)) => {
                if self.config.validate_result {
                    if let Err(diagnostic) = validate_result(&value, self.config.max_response_bytes) {
                        warn!(
                            invocation_id = %inv.invocation_id,
                            diagnostic = ?diagnostic,
                            "Handler result failed validation"
                        );
                        diagnostics.push(diagnostic);
                    }
                }
                Ok(value)
            }
            Ok(Err(e)) => Err(HandlerFault::Error(e)),
            Err((payload, details)) => Err(HandlerFault::from_captured_panic(payload, details)),
        };
        let failure = result.as_ref().err().map(HandlerFault::to_error_object);
        advance(
            &mut lifecycle,
            if result.is_ok() {
                InvocationState::Succeeded
            } else {
                InvocationState::Failed
            },
            &inv,
        );

        if let Some(handle) = watchdog.as_mut() {
            handle.settle(self.config.report_grace).await;
        }
        diagnostics.extend(
            timeout_diagnostics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..),
        );

        match &result {
            Ok(_) => {
                self.report_soft_failures(&inv, call_tree.as_ref(), &mut diagnostics)
                    .await;
                if self.config.notify_on_success {
                    self.notify_success(&inv, call_tree.as_ref(), &mut diagnostics)
                        .await;
                }
            }
            Err(fault) => {
                self.report_fault(
                    &inv,
                    fault.is_panic(),
                    fault.to_error_object(),
                    timeout_warning_fired,
                    call_tree.as_ref(),
                    &mut diagnostics,
                )
                .await;
            }
        }
        advance(&mut lifecycle, InvocationState::Reported, &inv);

        let outcome = InvocationOutcome {
            invocation_id: inv.invocation_id.clone(),
            result,
            failure,
            diagnostics,
            call_tree,
            timeout_warning_fired,
            elapsed: inv.elapsed(),
        };
        debug!(
            invocation_id = %outcome.invocation_id,
            success = outcome.is_success(),
            timeout_warning_fired,
            diagnostics = outcome.diagnostics.len(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Invocation finished"
        );
        advance(&mut lifecycle, InvocationState::Idle, &inv);
        outcome
    }

    /// Run one invocation and return only the primary outcome.
    pub async fn run<E, C>(&self, event: E, ctx: C) -> Result<H::Output, HandlerFault<H::Error>>
    where
        H: Handler<E, C>,
        H::Output: Serialize,
        H::Error: fmt::Display + fmt::Debug,
        C: PlatformContext,
    {
        self.invoke(event, ctx).await.into_result()
    }

    async fn report_fault(
        &self,
        inv: &InvocationContext,
        panicked: bool,
        error: ErrorObject,
        timeout_warning_fired: bool,
        call_tree: Option<&CallTree>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let message = if panicked {
            "Handler panic detected"
        } else {
            "Unhandled runtime error detected"
        };
        error!(
            invocation_id = %inv.invocation_id,
            function_name = %inv.function_name,
            handler = %inv.handler_name,
            error_type = %error.error_type,
            error_message = %error.error_message,
            timeout_warning_fired,
            "{message}"
        );

        let report = FailureReport::new(
            ReportKind::HandlerFault,
            error.clone(),
            &inv.invocation_id,
            &inv.function_name,
            &inv.handler_name,
        )
        .with_tag("is_timeout", "false")
        .with_tag("timeout_warning_fired", timeout_warning_fired.to_string())
        .with_tag("function_name", &inv.function_name)
        .with_tag("handler", &inv.handler_name)
        .with_call_tree(call_tree.cloned());
        let crash_reported = capture(self.reporter.as_ref(), &report, diagnostics).await;

        let notification = Notification {
            severity: Severity::Failure,
            title: "Execution failed".to_string(),
            context_message: message.to_string(),
            detail: error.to_string(),
            invocation_id: inv.invocation_id.clone(),
            function_name: inv.function_name.clone(),
            handler_name: inv.handler_name.clone(),
            trace_summary: call_tree.map(|t| t.format_top_calls(NOTIFIED_TOP_CALLS)),
            crash_reported: Some(crash_reported),
        };
        deliver(self.notifier.as_ref(), &notification, diagnostics).await;
    }

    async fn report_soft_failures(
        &self,
        inv: &InvocationContext,
        call_tree: Option<&CallTree>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let soft: Vec<Diagnostic> = diagnostics
            .iter()
            .filter(|d| d.is_soft_failure())
            .cloned()
            .collect();

        for diagnostic in soft {
            let error = diagnostic.to_error_object();
            let report = FailureReport::new(
                ReportKind::SoftValidation,
                error.clone(),
                &inv.invocation_id,
                &inv.function_name,
                &inv.handler_name,
            )
            .with_fingerprint([error.error_type.as_str(), inv.function_name.as_str()])
            .with_tag("function_name", &inv.function_name)
            .with_tag("handler", &inv.handler_name)
            .with_call_tree(call_tree.cloned());
            let crash_reported = capture(self.reporter.as_ref(), &report, diagnostics).await;

            let notification = Notification {
                severity: Severity::SoftFailure,
                title: "Invalid handler result".to_string(),
                context_message: "Handler result failed validation, returning it unchanged".to_string(),
                detail: error.to_string(),
                invocation_id: inv.invocation_id.clone(),
                function_name: inv.function_name.clone(),
                handler_name: inv.handler_name.clone(),
                trace_summary: None,
                crash_reported: Some(crash_reported),
            };
            deliver(self.notifier.as_ref(), &notification, diagnostics).await;
        }
    }

    async fn notify_success(
        &self,
        inv: &InvocationContext,
        call_tree: Option<&CallTree>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let notification = Notification {
            severity: Severity::Success,
            title: "Execution succeeded".to_string(),
            context_message: format!(
                "Invocation finished in {:.3}s",
                inv.elapsed().as_secs_f64()
            ),
            detail: "Handler returned a value".to_string(),
            invocation_id: inv.invocation_id.clone(),
            function_name: inv.function_name.clone(),
            handler_name: inv.handler_name.clone(),
            trace_summary: call_tree.map(|t| t.format_top_calls(NOTIFIED_TOP_CALLS)),
            crash_reported: None,
        };
        deliver(self.notifier.as_ref(), &notification, diagnostics).await;
    }
}

impl<H> fmt::Debug for SafeWrapper<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeWrapper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "slack")]
fn default_notifier(config: &WrapperConfig) -> Arc<dyn NotificationSink> {
    if config.slack_webhook_url.is_some() {
        Arc::new(crate::sinks::slack::SlackNotifier::from_config(config))
    } else {
        Arc::new(LogNotifier)
    }
}

#[cfg(not(feature = "slack"))]
fn default_notifier(_config: &WrapperConfig) -> Arc<dyn NotificationSink> {
    Arc::new(LogNotifier)
}

fn advance(lifecycle: &mut Lifecycle, next: InvocationState, inv: &InvocationContext) {
    if let Err(e) = lifecycle.advance(next) {
        error!(invocation_id = %inv.invocation_id, error = %e, "Invocation lifecycle violated");
    }
}

/// Run a sink call, turning a panic into a delivery error.
async fn guarded<F>(sink: &'static str, call: F) -> Result<(), SinkError>
where
    F: Future<Output = Result<(), SinkError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = match HandlerFault::<SinkError>::from_panic(payload) {
                HandlerFault::Panic { message, .. } => format!("sink panicked: {message}"),
                HandlerFault::Error(e) => e.to_string(),
            };
            Err(SinkError::Delivery { sink, message })
        }
    }
}

/// Deliver a report; returns whether it was accepted.
async fn capture(
    reporter: &dyn CrashReporter,
    report: &FailureReport,
    diagnostics: &mut Vec<Diagnostic>,
) -> bool {
    match guarded("crash-reporter", reporter.capture(report)).await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                sink = e.sink(),
                error = %e,
                invocation_id = %report.invocation_id,
                "Failed to deliver failure report"
            );
            diagnostics.push(Diagnostic::SinkFailed {
                sink: e.sink().to_string(),
                message: e.to_string(),
            });
            false
        }
    }
}

async fn deliver(
    notifier: &dyn NotificationSink,
    notification: &Notification,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if let Err(e) = guarded("notifier", notifier.notify(notification)).await {
        warn!(
            sink = e.sink(),
            error = %e,
            invocation_id = %notification.invocation_id,
            "Failed to deliver notification"
        );
        diagnostics.push(Diagnostic::SinkFailed {
            sink: e.sink().to_string(),
            message: e.to_string(),
        });
    }
}

/// Timeout-warning path, run on the watchdog task.
async fn report_timeout(
    reporter: &dyn CrashReporter,
    notifier: &dyn NotificationSink,
    notify: bool,
    inv: &InvocationContext,
    session: Option<&TracingSession>,
    info: FireInfo,
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let warning = TimeoutWarning {
        invocation_id: inv.invocation_id.clone(),
        function_name: inv.function_name.clone(),
        handler_name: inv.handler_name.clone(),
        elapsed: inv.elapsed(),
        lead_time: inv.lead_time,
        configured_timeout_secs: inv.configured_timeout_secs(),
        partial_trace: session.map(TracingSession::snapshot),
    };
    let message = warning.message();
    let trace_summary = warning
        .partial_trace
        .as_ref()
        .map(|t| t.format_top_calls(NOTIFIED_TOP_CALLS));

    let report = FailureReport::new(
        ReportKind::TimeoutWarning,
        ErrorObject::new("TimeoutWarning", message.clone()),
        &inv.invocation_id,
        &inv.function_name,
        &inv.handler_name,
    )
    .with_fingerprint(["TimeoutWarning", inv.function_name.as_str()])
    .with_tag("is_timeout", "true")
    .with_tag(
        "timeout_value_seconds",
        warning.configured_timeout_secs.to_string(),
    )
    .with_tag("function_name", &inv.function_name)
    .with_tag("handler", &inv.handler_name)
    .with_call_tree(warning.partial_trace.clone());
    let crash_reported = capture(reporter, &report, &mut diagnostics).await;

    error!(
        invocation_id = %inv.invocation_id,
        function_name = %inv.function_name,
        elapsed_ms = warning.elapsed.as_millis() as u64,
        scheduled_delay_ms = info.scheduled_delay.as_millis() as u64,
        crash_reported,
        longest_calls = trace_summary.as_deref(),
        "{message}"
    );

    if notify {
        let notification = Notification {
            severity: Severity::TimeoutWarning,
            title: "Execution timeout warning".to_string(),
            context_message: message.clone(),
            detail: message,
            invocation_id: inv.invocation_id.clone(),
            function_name: inv.function_name.clone(),
            handler_name: inv.handler_name.clone(),
            trace_summary,
            crash_reported: Some(crash_reported),
        };
        deliver(notifier, &notification, &mut diagnostics).await;
    }

    diagnostics
}
