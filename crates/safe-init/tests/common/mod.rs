// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for safe-init integration tests.
//!
//! Provides recording and failing sinks plus context helpers.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::ser::{Error as _, Serialize, Serializer};

use safe_init::{
    CrashReporter, FailureReport, Notification, NotificationSink, ReportKind, Severity, SinkError,
    StaticContext, WrapperConfig,
};

/// Crash reporter that keeps every report it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<FailureReport>>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: ReportKind) -> Vec<FailureReport> {
        self.reports()
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect()
    }
}

#[async_trait]
impl CrashReporter for RecordingReporter {
    async fn capture(&self, report: &FailureReport) -> Result<(), SinkError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Notification sink that keeps every notification it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn of_severity(&self, severity: Severity) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(|n| n.severity == severity)
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), SinkError> {
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Crash reporter that always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingReporter;

#[async_trait]
impl CrashReporter for FailingReporter {
    async fn capture(&self, _report: &FailureReport) -> Result<(), SinkError> {
        Err(SinkError::Delivery {
            sink: "failing-reporter",
            message: "connection refused".to_string(),
        })
    }
}

/// Notification sink that always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingNotifier;

#[async_trait]
impl NotificationSink for FailingNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<(), SinkError> {
        Err(SinkError::Rejected {
            sink: "failing-notifier",
            status: 500,
            body: "internal error".to_string(),
        })
    }
}

/// Notification sink that panics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanickingNotifier;

#[async_trait]
impl NotificationSink for PanickingNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<(), SinkError> {
        panic!("notifier exploded");
    }
}

/// A value whose serialization always fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unserializable(pub u32);

impl Serialize for Unserializable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("value holds a live connection"))
    }
}

/// Context with `remaining` until the deadline.
pub fn ctx(id: &str, remaining: Duration) -> StaticContext {
    StaticContext::new(id, "orders-fn", remaining)
}

/// Configuration with a 5s lead time and the agent span enabled.
pub fn config() -> WrapperConfig {
    WrapperConfig::new("orders.handler").with_notify_sec_before_timeout(5)
}
