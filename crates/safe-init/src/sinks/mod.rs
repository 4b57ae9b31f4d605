// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reporting sinks.
//!
//! The wrapper reports to two collaborators:
//! - a [`CrashReporter`] receiving structured failure reports
//! - a [`NotificationSink`] receiving human-facing notifications
//!
//! Implementations shipped here:
//! - `log`: write reports and notifications to the tracing subscriber (default)
//! - `slack`: post notifications to a chat incoming-webhook

pub mod log;

#[cfg(feature = "slack")]
pub mod slack;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SinkError;
use crate::outcome::ErrorObject;
use crate::tracer::CallTree;

/// What a failure report is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// The handler returned an error or panicked
    HandlerFault,
    /// The deadline watchdog fired
    TimeoutWarning,
    /// The handler's value failed validation
    SoftValidation,
}

/// Structured report delivered to a [`CrashReporter`].
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub kind: ReportKind,
    pub error: ErrorObject,
    pub invocation_id: String,
    pub function_name: String,
    pub handler_name: String,
    pub tags: BTreeMap<String, String>,
    /// Grouping key for the reporting service
    pub fingerprint: Vec<String>,
    pub call_tree: Option<CallTree>,
    pub timestamp: DateTime<Utc>,
}

impl FailureReport {
    /// Create a report stamped with the current time.
    pub fn new(
        kind: ReportKind,
        error: ErrorObject,
        invocation_id: impl Into<String>,
        function_name: impl Into<String>,
        handler_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            error,
            invocation_id: invocation_id.into(),
            function_name: function_name.into(),
            handler_name: handler_name.into(),
            tags: BTreeMap::new(),
            fingerprint: Vec::new(),
            call_tree: None,
            timestamp: Utc::now(),
        }
    }

    /// Add a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Set the grouping fingerprint.
    pub fn with_fingerprint<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fingerprint = parts.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a call tree.
    pub fn with_call_tree(mut self, tree: Option<CallTree>) -> Self {
        self.call_tree = tree;
        self
    }
}

/// Error-reporting service.
#[async_trait]
pub trait CrashReporter: Send + Sync {
    /// Deliver one report.
    async fn capture(&self, report: &FailureReport) -> Result<(), SinkError>;
}

/// How urgent a notification is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    TimeoutWarning,
    Failure,
    SoftFailure,
    Success,
}

/// Human-facing notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    /// One-line summary shown under the title
    pub context_message: String,
    /// Error or warning text
    pub detail: String,
    pub invocation_id: String,
    pub function_name: String,
    pub handler_name: String,
    /// Markdown list of the slowest calls, when tracing was enabled
    pub trace_summary: Option<String>,
    /// Whether the matching crash report was delivered
    pub crash_reported: Option<bool>,
}

/// Chat or paging service.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification.
    async fn notify(&self, notification: &Notification) -> Result<(), SinkError>;
}
