// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call tracer.
//!
//! Records the start, end and nesting of instrumented calls made while a
//! handler runs. Functions opt in with `#[traced]` (or [`trace_scope!`] for an
//! arbitrary block); each call opens a frame under the frame of its caller
//! and closes it when the call returns, propagates an error, or unwinds.
//!
//! An instrumented `async fn` runs in its own scope, so futures polled side
//! by side (`join!`, `select!`) are recorded as siblings with their own
//! timings. The current session is task-local, so concurrent invocations in
//! one process never see each other's frames. Outside a session every hook is
//! a no-op.
//!
//! [`trace_scope!`]: crate::trace_scope

mod session;
mod tree;

use std::future::Future;

pub use session::{FrameGuard, TracingSession};
pub use tree::{CallFrame, CallSummary, CallTree, TreeStats, format_summaries};

/// Open a frame for an instrumented call in the current session.
///
/// The frame stays open until the returned guard is dropped. This is the hook
/// `#[traced]` expands to.
pub fn enter(function: &'static str, file: &'static str, line: u32) -> FrameGuard {
    session::enter(function, file, line)
}

/// Run `future` as one instrumented call in the current session.
///
/// Calls made while the future runs become its children, whatever else is
/// polled alongside it. This is the hook `#[traced]` expands to for
/// `async fn`.
pub async fn instrument<F: Future>(
    function: &'static str,
    file: &'static str,
    line: u32,
    future: F,
) -> F::Output {
    session::instrument(function, file, line, future).await
}

/// True when the calling task runs inside a tracing session scope.
pub fn is_active() -> bool {
    session::is_active()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WrapperConfig;
    use crate::context::{InvocationContext, StaticContext};
    use crate::error::TraceError;
    use std::time::Duration;

    fn session_with(config: WrapperConfig) -> TracingSession {
        let ctx = StaticContext::new("req-1", "test-fn", Duration::from_secs(30));
        TracingSession::activate(&InvocationContext::new(&ctx, &config))
    }

    fn session() -> TracingSession {
        session_with(WrapperConfig::new("handler").with_home_paths(["home/"]))
    }

    async fn leaf() {
        let _frame = enter("leaf", "home/leaf.rs", 10);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    async fn middle() {
        let _frame = enter("middle", "lib/middle.rs", 20);
        leaf().await;
        leaf().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_calls_build_tree() {
        let session = session();
        session.scope(middle()).await;

        let tree = session.finalize().unwrap();
        assert!(tree.complete);
        assert!(tree.is_well_formed());
        assert_eq!(tree.root.function, "handler");
        assert_eq!(tree.root.file, "");
        assert_eq!(tree.root.line, 0);
        assert_eq!(tree.root.children.len(), 1);

        let middle = &tree.root.children[0];
        assert_eq!(middle.function, "middle");
        assert_eq!(middle.depth, 1);
        assert!(!middle.is_home);
        let elapsed = middle.duration().unwrap();
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(210));
        assert_eq!(middle.children.len(), 2);
        assert!(middle.children.iter().all(|c| c.is_home && c.depth == 2));
        assert_eq!(tree.stats.frame_count, 4);
        assert_eq!(tree.stats.max_depth, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_twice_rejected() {
        let session = session();
        assert!(session.finalize().is_ok());
        assert_eq!(session.finalize().unwrap_err(), TraceError::AlreadyFinalized);
        assert!(session.is_finalized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_after_finalize_ignored() {
        let session = session();
        let tree = session.finalize().unwrap();

        let guard = session.scope(async { enter("late", "x.rs", 1) }).await;
        assert!(!guard.is_recording());
        drop(guard);

        assert_eq!(tree.stats.frame_count, 1);
        assert_eq!(session.snapshot().stats.frame_count, 1);
    }

    #[tokio::test]
    async fn test_inert_outside_session() {
        assert!(!is_active());
        let guard = enter("free", "x.rs", 1);
        assert!(!guard.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_while_running() {
        let session = session();
        let snapshot = session
            .scope(async {
                let _outer = enter("outer", "x.rs", 1);
                {
                    let _done = enter("done", "x.rs", 2);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                session.snapshot()
            })
            .await;

        assert!(!snapshot.complete);
        assert!(snapshot.is_well_formed());
        let outer = &snapshot.root.children[0];
        assert!(!outer.is_closed());
        assert!(outer.children[0].is_closed());
        assert_eq!(snapshot.summaries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_cap_counts_dropped() {
        let session = session_with(WrapperConfig::new("handler").with_max_trace_frames(3));
        session
            .scope(async {
                for _ in 0..5 {
                    let _f = enter("f", "x.rs", 1);
                }
            })
            .await;

        let tree = session.finalize().unwrap();
        assert_eq!(tree.stats.frame_count, 3);
        assert_eq!(tree.dropped_frames, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_drop_closes_descendants() {
        let session = session();
        session
            .scope(async {
                let outer = enter("outer", "x.rs", 1);
                let inner = enter("inner", "x.rs", 2);
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(outer);
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(inner);
                let _sibling = enter("sibling", "x.rs", 3);
            })
            .await;

        let tree = session.finalize().unwrap();
        assert!(tree.is_well_formed());
        let outer = &tree.root.children[0];
        assert_eq!(outer.end_us, outer.children[0].end_us);
        assert_eq!(tree.root.children[1].function, "sibling");
        assert_eq!(tree.root.children[1].depth, 1);
    }

    async fn timed(name: &'static str, ms: u64) {
        instrument(name, "x.rs", 1, async move {
            let _step = enter("step", "x.rs", 2);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_futures_are_siblings() {
        let session = session();
        session
            .scope(async {
                tokio::join!(timed("short", 10), timed("long", 50));
            })
            .await;

        let tree = session.finalize().unwrap();
        assert!(tree.is_well_formed());
        let [short, long] = tree.root.children.as_slice() else {
            panic!("expected two children, got {:?}", tree.root.children);
        };
        assert_eq!(short.function, "short");
        assert_eq!(long.function, "long");
        assert_eq!(long.depth, 1);
        assert!(short.duration().unwrap() < Duration::from_millis(20));
        assert!(long.duration().unwrap() >= Duration::from_millis(50));
        assert_eq!(short.children.len(), 1);
        assert_eq!(long.children.len(), 1);
        assert_eq!(long.children[0].depth, 2);
        assert_eq!(long.children[0].end_us, long.end_us);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_closes_its_frame() {
        let session = session();
        session
            .scope(async {
                tokio::select! {
                    _ = timed("winner", 10) => {}
                    _ = timed("loser", 100) => {}
                }
                tokio::time::sleep(Duration::from_millis(40)).await;
            })
            .await;

        let tree = session.finalize().unwrap();
        assert!(tree.is_well_formed());
        let loser = tree
            .root
            .children
            .iter()
            .find(|f| f.function == "loser")
            .unwrap();
        let elapsed = loser.duration().unwrap();
        assert!(elapsed >= Duration::from_millis(10) && elapsed < Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_tasks_not_traced() {
        let session = session();
        let recorded = session
            .scope(async {
                tokio::spawn(async { enter("spawned", "x.rs", 1).is_recording() })
                    .await
                    .unwrap()
            })
            .await;

        assert!(!recorded);
        assert_eq!(session.finalize().unwrap().stats.frame_count, 1);
    }
}
