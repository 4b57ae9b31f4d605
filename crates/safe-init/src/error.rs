// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the wrapper and its collaborators.

use thiserror::Error;

/// Errors that can occur inside safe-init itself.
///
/// None of these ever replace a handler's own outcome: the wrapper logs them
/// and records them as diagnostics.
#[derive(Debug, Error)]
pub enum SafeInitError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// A reporting or notification sink failed
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Call tracer misuse
    #[error(transparent)]
    Trace(#[from] TraceError),

    /// Filesystem error (extra environment file)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of an external collaborator (crash reporter, chat sink).
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink is not configured (e.g. no webhook URL)
    #[error("{sink} is not configured: {reason}")]
    NotConfigured {
        /// Sink name
        sink: &'static str,
        /// Why the sink cannot deliver
        reason: String,
    },

    /// The sink was reached but rejected the payload
    #[error("{sink} rejected the message: {status} {body}")]
    Rejected {
        /// Sink name
        sink: &'static str,
        /// HTTP status or equivalent code
        status: u16,
        /// Response body, if any
        body: String,
    },

    /// The sink could not be reached
    #[error("{sink} delivery failed: {message}")]
    Delivery {
        /// Sink name
        sink: &'static str,
        /// Transport error
        message: String,
    },
}

impl SinkError {
    /// Name of the sink that produced this error.
    pub fn sink(&self) -> &'static str {
        match self {
            SinkError::NotConfigured { sink, .. }
            | SinkError::Rejected { sink, .. }
            | SinkError::Delivery { sink, .. } => sink,
        }
    }
}

/// Call tracer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    /// `finalize` was called on a session that already produced its tree
    #[error("tracing session already finalized")]
    AlreadyFinalized,
}

/// Type alias for safe-init results.
pub type Result<T> = std::result::Result<T, SafeInitError>;
