// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deadline watchdog.
//!
//! One background task per invocation sleeps until `deadline - lead_time` and
//! then runs a timeout-warning callback, unless the invocation finishes first
//! and cancels it. The callback never interrupts the handler.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::tracer::CallTree;

const SCHEDULED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Lifecycle of a watchdog. `Fired` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogState {
    Scheduled,
    Fired,
    Cancelled,
}

impl WatchdogState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            FIRED => WatchdogState::Fired,
            CANCELLED => WatchdogState::Cancelled,
            _ => WatchdogState::Scheduled,
        }
    }
}

/// Passed to the callback when the watchdog fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireInfo {
    /// Time between arming and firing
    pub elapsed: Duration,
    /// Delay computed at arming time
    pub scheduled_delay: Duration,
}

/// Deadline watchdog factory.
pub struct Watchdog;

impl Watchdog {
    /// Schedule `on_fire` to run once, `remaining_millis - lead_time` from now.
    ///
    /// A delay of zero or less fires right away: the handle is `Fired` before
    /// this returns and the callback runs on the spawned task. Must be called
    /// from within a tokio runtime.
    pub fn arm<F, Fut>(remaining_millis: i64, lead_time: Duration, on_fire: F) -> WatchdogHandle
    where
        F: FnOnce(FireInfo) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lead_ms = i64::try_from(lead_time.as_millis()).unwrap_or(i64::MAX);
        let delay_ms = remaining_millis.saturating_sub(lead_ms);
        let delay = Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0));
        let fire_now = delay.is_zero();

        let state = Arc::new(AtomicU8::new(if fire_now { FIRED } else { SCHEDULED }));
        let cancel_token = CancellationToken::new();
        let armed_at = Instant::now();

        debug!(
            remaining_ms = remaining_millis,
            lead_ms = lead_time.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            "Deadline watchdog armed"
        );

        let task = tokio::spawn({
            let state = state.clone();
            let cancel_token = cancel_token.clone();
            async move {
                if !fire_now {
                    tokio::select! {
                        biased;

                        _ = cancel_token.cancelled() => {
                            debug!("Deadline watchdog cancelled before firing");
                            return;
                        }

                        _ = tokio::time::sleep(delay) => {}
                    }

                    if state
                        .compare_exchange(SCHEDULED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        debug!("Deadline watchdog lost the race against cancellation");
                        return;
                    }
                }

                let info = FireInfo {
                    elapsed: armed_at.elapsed(),
                    scheduled_delay: delay,
                };
                debug!(elapsed_ms = info.elapsed.as_millis() as u64, "Deadline watchdog fired");

                let callback = AssertUnwindSafe(async move { on_fire(info).await });
                if callback.catch_unwind().await.is_err() {
                    error!("Timeout warning callback panicked");
                }
            }
        });

        WatchdogHandle {
            state,
            cancel_token,
            task: Some(task),
        }
    }
}

/// Handle to an armed watchdog. Dropping the handle cancels it.
pub struct WatchdogHandle {
    state: Arc<AtomicU8>,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Suppress a pending firing.
    ///
    /// Idempotent. Returns the terminal state: `Cancelled` if this call (or an
    /// earlier one) won, `Fired` if the watchdog fired first, in which case
    /// nothing happens.
    pub fn cancel(&self) -> WatchdogState {
        match self.state.compare_exchange(
            SCHEDULED,
            CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.cancel_token.cancel();
                debug!("Deadline watchdog cancellation requested");
                WatchdogState::Cancelled
            }
            Err(current) => WatchdogState::from_raw(current),
        }
    }

    /// Current state.
    pub fn state(&self) -> WatchdogState {
        WatchdogState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// True if the watchdog fired.
    pub fn has_fired(&self) -> bool {
        self.state() == WatchdogState::Fired
    }

    /// Wait up to `grace` for a fired callback to finish.
    ///
    /// Returns immediately unless the watchdog fired. A callback still running
    /// after `grace` keeps running detached.
    pub async fn settle(&mut self, grace: Duration) -> WatchdogState {
        let state = self.state();
        if state != WatchdogState::Fired {
            return state;
        }
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => debug!("Timeout warning callback finished"),
                Ok(Err(e)) => warn!(error = %e, "Timeout warning task failed"),
                Err(_) => warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Timeout warning callback still running after grace period"
                ),
            }
        }
        state
    }
}

impl fmt::Debug for WatchdogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchdogHandle")
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Report produced when the watchdog fires during an invocation.
#[derive(Debug, Clone, Serialize)]
pub struct TimeoutWarning {
    pub invocation_id: String,
    pub function_name: String,
    pub handler_name: String,
    /// Time since the invocation started
    pub elapsed: Duration,
    pub lead_time: Duration,
    /// Whole-invocation timeout in seconds, rounded
    pub configured_timeout_secs: u64,
    /// Calls recorded up to the firing instant, if tracing was enabled
    pub partial_trace: Option<CallTree>,
}

impl TimeoutWarning {
    /// Human-readable warning text.
    pub fn message(&self) -> String {
        format!(
            "Impending execution timeout detected: less than {} seconds left to configured timeout ({}s).",
            self.lead_time.as_secs(),
            self.configured_timeout_secs
        )
    }
}

impl fmt::Display for TimeoutWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (Arc<AtomicUsize>, impl FnOnce(FireInfo) -> futures::future::Ready<()> + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        (count, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (count, on_fire) = counting();
        let mut handle = Watchdog::arm(10_000, Duration::from_secs(5), on_fire);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(handle.state(), WatchdogState::Scheduled);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.settle(Duration::from_secs(1)).await, WatchdogState::Fired);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire() {
        let (count, on_fire) = counting();
        let handle = Watchdog::arm(10_000, Duration::from_secs(5), on_fire);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.cancel(), WatchdogState::Cancelled);
        assert_eq!(handle.cancel(), WatchdogState::Cancelled);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!handle.has_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_noop() {
        let (count, on_fire) = counting();
        let mut handle = Watchdog::arm(6_000, Duration::from_secs(5), on_fire);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.cancel(), WatchdogState::Fired);
        assert_eq!(handle.settle(Duration::from_secs(1)).await, WatchdogState::Fired);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lead_exceeding_remaining_fires_immediately() {
        let (count, on_fire) = counting();
        let mut handle = Watchdog::arm(3_000, Duration::from_secs(5), on_fire);

        assert_eq!(handle.state(), WatchdogState::Fired);
        assert_eq!(handle.cancel(), WatchdogState::Fired);
        handle.settle(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_panic_is_contained() {
        let mut handle = Watchdog::arm(0, Duration::ZERO, |_| async {
            panic!("callback failure");
        });
        assert_eq!(handle.settle(Duration::from_secs(1)).await, WatchdogState::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_info() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = Watchdog::arm(8_000, Duration::from_secs(5), move |info| async move {
            let _ = tx.send(info);
        });

        let info = rx.await.unwrap();
        assert_eq!(info.scheduled_delay, Duration::from_secs(3));
        assert!(info.elapsed >= Duration::from_secs(3));
        assert!(handle.has_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (count, on_fire) = counting();
        drop(Watchdog::arm(6_000, Duration::from_secs(5), on_fire));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timeout_message() {
        let warning = TimeoutWarning {
            invocation_id: "req".to_string(),
            function_name: "fn".to_string(),
            handler_name: "handler".to_string(),
            elapsed: Duration::from_secs(5),
            lead_time: Duration::from_secs(5),
            configured_timeout_secs: 10,
            partial_trace: None,
        };
        assert_eq!(
            warning.to_string(),
            "Impending execution timeout detected: less than 5 seconds left to configured timeout (10s)."
        );
    }
}
