// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation outcome types.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::panic_capture::PanicDetails;
use crate::tracer::CallTree;

/// Failure of the wrapped handler.
#[derive(Debug, Error)]
pub enum HandlerFault<E> {
    /// The handler returned an error
    #[error("{0}")]
    Error(E),

    /// The handler panicked
    #[error("handler panicked: {message}")]
    Panic {
        /// Panic payload, when it was a string
        message: String,
        /// `file:line:column` of the panic
        location: Option<String>,
        /// Stack at the panic site
        backtrace: Option<String>,
    },
}

impl<E> HandlerFault<E> {
    /// Build a fault from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::from_captured_panic(payload, None)
    }

    /// Build a fault from a caught panic payload and the hook's details.
    pub(crate) fn from_captured_panic(
        payload: Box<dyn Any + Send>,
        details: Option<PanicDetails>,
    ) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        let (location, backtrace) = match details {
            Some(details) => (details.location, Some(details.backtrace)),
            None => (None, None),
        };
        HandlerFault::Panic {
            message,
            location,
            backtrace,
        }
    }

    /// True if the handler panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, HandlerFault::Panic { .. })
    }

    /// The returned error, if the handler did not panic.
    pub fn into_error(self) -> Option<E> {
        match self {
            HandlerFault::Error(e) => Some(e),
            HandlerFault::Panic { .. } => None,
        }
    }
}

impl<E: fmt::Display + fmt::Debug> HandlerFault<E> {
    /// Error identity, message and details as reported to sinks.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            HandlerFault::Error(e) => ErrorObject::with_stack_trace(
                std::any::type_name::<E>(),
                e.to_string(),
                format!("{e:?}"),
            ),
            HandlerFault::Panic {
                message,
                location,
                backtrace,
            } => {
                let stack_trace = match (location, backtrace) {
                    (Some(location), Some(backtrace)) => {
                        Some(format!("panicked at {location}\n{backtrace}"))
                    }
                    (Some(location), None) => Some(format!("panicked at {location}")),
                    (None, Some(backtrace)) => Some(backtrace.clone()),
                    (None, None) => None,
                };
                ErrorObject {
                    error_type: "Panic".to_string(),
                    error_message: message.clone(),
                    stack_trace,
                }
            }
        }
    }
}

/// Captured failure details, in the platform's error shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// The error type/name
    #[serde(rename = "ErrorType")]
    pub error_type: String,
    /// The error message
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
    /// Optional stack trace or error chain
    #[serde(rename = "StackTrace", skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorObject {
    /// Creates a new ErrorObject.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
        }
    }

    /// Creates a new ErrorObject with a stack trace.
    pub fn with_stack_trace(
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        stack_trace: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: Some(stack_trace.into()),
        }
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

/// Non-fatal finding recorded next to the primary outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// The successful result could not be serialized to JSON
    NotSerializable { message: String },
    /// The serialized result exceeds the response size limit
    ResponseTooLarge { size: usize, limit: usize },
    /// A reporting sink failed
    SinkFailed { sink: String, message: String },
}

impl Diagnostic {
    /// True for findings about the handler's result (as opposed to sink failures).
    pub fn is_soft_failure(&self) -> bool {
        matches!(
            self,
            Diagnostic::NotSerializable { .. } | Diagnostic::ResponseTooLarge { .. }
        )
    }

    /// Failure details for reporting.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Diagnostic::NotSerializable { message } => ErrorObject::new(
                "SerializationError",
                format!("Handler result is not JSON serializable: {message}"),
            ),
            Diagnostic::ResponseTooLarge { size, limit } => ErrorObject::new(
                "ResponseTooLarge",
                format!("Response size {size} bytes exceeds maximum {limit} bytes"),
            ),
            Diagnostic::SinkFailed { sink, message } => {
                ErrorObject::new("SinkFailed", format!("{sink}: {message}"))
            }
        }
    }
}

/// Everything known about a finished invocation.
#[derive(Debug)]
pub struct InvocationOutcome<T, E> {
    pub invocation_id: String,
    /// Primary outcome delivered to the platform
    pub result: Result<T, HandlerFault<E>>,
    /// Failure details of a handler fault
    pub failure: Option<ErrorObject>,
    /// Soft failures and sink failures, in the order they were found
    pub diagnostics: Vec<Diagnostic>,
    /// Call tree, when tracing was enabled
    pub call_tree: Option<CallTree>,
    /// True if the timeout warning fired before the handler finished
    pub timeout_warning_fired: bool,
    pub elapsed: Duration,
}

impl<T, E> InvocationOutcome<T, E> {
    /// True if the handler produced a value.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Diagnostics about the handler's result.
    pub fn soft_failures(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_soft_failure())
    }

    /// Discard the side information and keep the primary outcome.
    pub fn into_result(self) -> Result<T, HandlerFault<E>> {
        self.result
    }
}
