// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chat notifications through an incoming-webhook endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{Notification, NotificationSink, Severity};
use crate::error::SinkError;

const SINK_NAME: &str = "slack";

/// Posts notifications as block-formatted webhook messages.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    webhook_url: Option<String>,
    environment: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl SlackNotifier {
    /// Create a notifier posting to `webhook_url`.
    pub fn new(webhook_url: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            webhook_url: Some(webhook_url.into()),
            environment: environment.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(15),
        }
    }

    /// Create a notifier from the wrapper configuration.
    ///
    /// Without a webhook URL every notification fails with
    /// [`SinkError::NotConfigured`].
    pub fn from_config(config: &crate::WrapperConfig) -> Self {
        Self {
            webhook_url: config.slack_webhook_url.clone(),
            environment: config.environment.clone(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(15),
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl NotificationSink for SlackNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), SinkError> {
        let Some(url) = self.webhook_url.as_deref() else {
            return Err(SinkError::NotConfigured {
                sink: SINK_NAME,
                reason: "SAFE_INIT_SLACK_WEBHOOK_URL is not set".to_string(),
            });
        };

        let message = build_slack_message(notification, &self.environment);
        let response = self
            .client
            .post(url)
            .json(&message)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SinkError::Delivery {
                sink: SINK_NAME,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                sink: SINK_NAME,
                status: status.as_u16(),
                body,
            });
        }

        debug!(invocation_id = %notification.invocation_id, "Slack notification sent");
        Ok(())
    }
}

/// Build the webhook payload for a notification.
pub fn build_slack_message(notification: &Notification, environment: &str) -> Value {
    let env = environment.to_uppercase();
    let title = &notification.title;

    let mut main_context = Vec::new();
    if !notification.handler_name.is_empty() {
        main_context.push(mrkdwn(format!(
            ":point_right: *Handler:* {}",
            notification.handler_name
        )));
    }
    if !notification.invocation_id.is_empty() {
        main_context.push(mrkdwn(format!(
            ":point_right: *Request ID:* {}",
            notification.invocation_id
        )));
    }
    if !notification.function_name.is_empty() {
        main_context.push(mrkdwn(format!(
            ":point_right: *Function name:* {}",
            notification.function_name
        )));
    }

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {"type": "plain_text", "text": format!("[{env}] {title} :hear_no_evil:")},
        }),
        json!({
            "type": "context",
            "elements": [{"type": "plain_text", "text": notification.context_message}],
        }),
        json!({"type": "divider"}),
        json!({
            "type": "section",
            "text": {"type": "plain_text", "text": format!(":face_palm: {}", notification.detail)},
        }),
        json!({"type": "context", "elements": main_context}),
    ];

    if let Some(summary) = &notification.trace_summary {
        blocks.push(json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": summary},
        }));
    }

    if let Some(reported) = notification.crash_reported {
        let text = if reported {
            ":ok_hand: The error has been sent to the error reporting service."
        } else {
            ":rage: There also was an error sending the event to the error reporting service."
        };
        blocks.push(json!({
            "type": "section",
            "text": {"type": "plain_text", "text": text},
        }));
    }

    let color = match notification.severity {
        Severity::Success => "#2eb67d",
        Severity::TimeoutWarning | Severity::SoftFailure => "#ecb22e",
        Severity::Failure => "#e12424",
    };

    json!({
        "text": format!("[{env}] Safe Init: {title} :pleading_face:"),
        "attachments": [{"color": color, "blocks": blocks}],
    })
}

fn mrkdwn(text: String) -> Value {
    json!({"type": "mrkdwn", "text": text})
}
