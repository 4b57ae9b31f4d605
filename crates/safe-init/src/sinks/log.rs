// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sinks that write to the tracing subscriber.

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{CrashReporter, FailureReport, Notification, NotificationSink, Severity};
use crate::error::SinkError;

/// Number of slowest calls included in logged reports.
const LOGGED_TOP_CALLS: usize = 40;

/// Crash reporter that logs every report as an error event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl CrashReporter for LogReporter {
    async fn capture(&self, report: &FailureReport) -> Result<(), SinkError> {
        let longest_calls = report
            .call_tree
            .as_ref()
            .map(|tree| tree.format_top_calls(LOGGED_TOP_CALLS));

        error!(
            kind = ?report.kind,
            error_type = %report.error.error_type,
            error_message = %report.error.error_message,
            stack_trace = report.error.stack_trace.as_deref(),
            invocation_id = %report.invocation_id,
            function_name = %report.function_name,
            handler = %report.handler_name,
            fingerprint = ?report.fingerprint,
            tags = ?report.tags,
            longest_calls = longest_calls.as_deref(),
            "Failure report"
        );
        Ok(())
    }
}

/// Notification sink that logs notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), SinkError> {
        match n.severity {
            Severity::Failure => error!(
                title = %n.title,
                detail = %n.detail,
                invocation_id = %n.invocation_id,
                handler = %n.handler_name,
                "{}",
                n.context_message
            ),
            Severity::TimeoutWarning | Severity::SoftFailure => warn!(
                title = %n.title,
                detail = %n.detail,
                invocation_id = %n.invocation_id,
                handler = %n.handler_name,
                trace_summary = n.trace_summary.as_deref(),
                "{}",
                n.context_message
            ),
            Severity::Success => info!(
                title = %n.title,
                invocation_id = %n.invocation_id,
                handler = %n.handler_name,
                "{}",
                n.context_message
            ),
        }
        Ok(())
    }
}

/// Notification sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationSink for NoopNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<(), SinkError> {
        Ok(())
    }
}
