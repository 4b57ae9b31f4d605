// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation lifecycle state machine.
//!
//! ```text
//! Idle -> Running -> Succeeded -> Reported -> Idle
//!                 \-> Failed ---/
//! ```

use serde::Serialize;
use thiserror::Error;

/// Phase of one invocation inside the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Reported,
}

impl InvocationState {
    /// True if `next` directly follows `self`.
    pub fn can_transition_to(self, next: InvocationState) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Reported)
                | (Failed, Reported)
                | (Reported, Idle)
        )
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid invocation transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: InvocationState,
    pub to: InvocationState,
}

/// Tracks the state of one invocation.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: InvocationState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Start in `Idle`.
    pub fn new() -> Self {
        Self {
            state: InvocationState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// Move to `next`, leaving the state untouched if the move is not allowed.
    pub fn advance(&mut self, next: InvocationState) -> Result<InvocationState, InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(next)
    }
}
