// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation call recorder.

use std::borrow::Cow;
use std::cell::Cell;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tracing::debug;

use super::tree::{CallFrame, CallTree};
use crate::context::InvocationContext;
use crate::error::TraceError;

tokio::task_local! {
    static CURRENT: Current;
}

/// Task-local view of a session: the recorder plus the frame new calls
/// attach to.
///
/// Every traced future runs in its own scope, so futures polled side by side
/// each see their own parent. Synchronous frames move `parent` down while
/// they are open and restore it on exit.
#[derive(Debug)]
struct Current {
    recorder: Arc<Recorder>,
    parent: Cell<usize>,
}

#[derive(Debug)]
struct RawFrame {
    function: Cow<'static, str>,
    file: Cow<'static, str>,
    line: u32,
    start_us: u64,
    end_us: Option<u64>,
    parent: Option<usize>,
    children: Vec<usize>,
    is_home: bool,
    depth: usize,
}

#[derive(Debug)]
struct RecorderState {
    frames: Vec<RawFrame>,
    finalized: bool,
    dropped: u64,
}

#[derive(Debug)]
struct Recorder {
    origin: Instant,
    max_frames: usize,
    home_paths: Arc<[String]>,
    state: Mutex<RecorderState>,
}

impl Recorder {
    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn is_home(&self, file: &str) -> bool {
        self.home_paths.iter().any(|p| file.contains(p.as_str()))
    }

    fn enter(
        &self,
        parent: usize,
        function: &'static str,
        file: &'static str,
        line: u32,
    ) -> Option<usize> {
        let is_home = self.is_home(file);
        let start_us = self.now_us();
        let mut state = self.lock();

        if state.finalized {
            return None;
        }
        if state.frames.len() >= self.max_frames {
            state.dropped += 1;
            return None;
        }

        // a parent closed out of order hands its children to the nearest open ancestor
        let mut parent = parent;
        while state.frames[parent].end_us.is_some() {
            match state.frames[parent].parent {
                Some(up) => parent = up,
                None => break,
            }
        }

        let depth = state.frames[parent].depth + 1;
        let idx = state.frames.len();
        state.frames.push(RawFrame {
            function: Cow::Borrowed(function),
            file: Cow::Borrowed(file),
            line,
            start_us,
            end_us: None,
            parent: Some(parent),
            children: Vec::new(),
            is_home,
            depth,
        });
        state.frames[parent].children.push(idx);
        Some(idx)
    }

    /// Close `idx` and any of its descendants that are still open.
    ///
    /// Sibling frames of concurrently polled futures are left untouched.
    fn exit(&self, idx: usize) {
        let end_us = self.now_us();
        let mut state = self.lock();
        if state.finalized || state.frames[idx].end_us.is_some() {
            return;
        }

        let mut pending = vec![idx];
        while let Some(open) = pending.pop() {
            let frame = &mut state.frames[open];
            if frame.end_us.is_none() {
                frame.end_us = Some(end_us);
            }
            pending.extend(frame.children.iter().copied());
        }
    }

    fn build(&self, state: &RecorderState, captured_at_us: u64, complete: bool) -> Option<CallTree> {
        fn to_frame(frames: &[RawFrame], idx: usize) -> CallFrame {
            let raw = &frames[idx];
            CallFrame {
                function: raw.function.clone(),
                file: raw.file.clone(),
                line: raw.line,
                start_us: raw.start_us,
                end_us: raw.end_us,
                is_home: raw.is_home,
                depth: raw.depth,
                children: raw.children.iter().map(|&c| to_frame(frames, c)).collect(),
            }
        }

        if state.frames.is_empty() {
            return None;
        }
        let root = to_frame(&state.frames, 0);
        Some(CallTree::new(root, captured_at_us, state.dropped, complete))
    }
}

/// Call recording for one invocation.
///
/// The session owns the root frame of the handler. Instrumented calls made
/// while a future runs inside [`TracingSession::scope`] become its
/// descendants.
#[derive(Debug, Clone)]
pub struct TracingSession {
    recorder: Arc<Recorder>,
}

impl TracingSession {
    /// Start a session for the invocation and open its root frame.
    pub fn activate(ctx: &InvocationContext) -> Self {
        let recorder = Recorder {
            origin: Instant::now(),
            max_frames: ctx.max_frames.max(1),
            home_paths: ctx.home_paths.clone(),
            state: Mutex::new(RecorderState {
                frames: vec![RawFrame {
                    function: Cow::Owned(ctx.handler_name.clone()),
                    file: Cow::Borrowed(""),
                    line: 0,
                    start_us: 0,
                    end_us: None,
                    parent: None,
                    children: Vec::new(),
                    is_home: false,
                    depth: 0,
                }],
                finalized: false,
                dropped: 0,
            }),
        };
        debug!(invocation_id = %ctx.invocation_id, "Tracing session activated");
        Self {
            recorder: Arc::new(recorder),
        }
    }

    /// Run `future` with this session as the current one.
    ///
    /// Tasks spawned from inside the future do not inherit the session.
    pub fn scope<F: Future>(&self, future: F) -> impl Future<Output = F::Output> + use<F> {
        let current = Current {
            recorder: self.recorder.clone(),
            parent: Cell::new(ROOT),
        };
        CURRENT.scope(current, future)
    }

    /// Consistent copy of the frames recorded so far.
    ///
    /// Calls still running appear with `end_us == None` and the tree is
    /// marked incomplete.
    pub fn snapshot(&self) -> CallTree {
        let captured_at = self.recorder.now_us();
        let state = self.recorder.lock();
        let complete = state.finalized;
        self.recorder
            .build(&state, captured_at, complete)
            .unwrap_or_else(|| CallTree::new(empty_root(), captured_at, 0, false))
    }

    /// Close every open frame and produce the final tree.
    ///
    /// Only the first call succeeds; instrumented calls after it are ignored.
    pub fn finalize(&self) -> Result<CallTree, TraceError> {
        let end_us = self.recorder.now_us();
        let mut state = self.recorder.lock();
        if state.finalized {
            return Err(TraceError::AlreadyFinalized);
        }

        for frame in state.frames.iter_mut().filter(|f| f.end_us.is_none()) {
            frame.end_us = Some(end_us);
        }
        state.finalized = true;

        let tree = self
            .recorder
            .build(&state, end_us, true)
            .unwrap_or_else(|| CallTree::new(empty_root(), end_us, 0, true));
        debug!(
            frames = tree.stats.frame_count,
            dropped = tree.dropped_frames,
            "Tracing session finalized"
        );
        Ok(tree)
    }

    /// True once [`finalize`](Self::finalize) has run.
    pub fn is_finalized(&self) -> bool {
        self.recorder.lock().finalized
    }
}

fn empty_root() -> CallFrame {
    CallFrame {
        function: Cow::Borrowed(""),
        file: Cow::Borrowed(""),
        line: 0,
        start_us: 0,
        end_us: Some(0),
        is_home: false,
        depth: 0,
        children: Vec::new(),
    }
}

/// Open frame of an instrumented call. The frame closes on drop.
///
/// Inert when no session was active at entry.
#[must_use = "the frame closes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct FrameGuard {
    active: Option<ActiveFrame>,
}

#[derive(Debug)]
struct ActiveFrame {
    recorder: Arc<Recorder>,
    idx: usize,
    /// Parent to restore in the enclosing scope, for synchronous frames
    restore: Option<usize>,
}

impl FrameGuard {
    /// True if this guard is recording a frame.
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let Some(frame) = self.active.take() else {
            return;
        };
        frame.recorder.exit(frame.idx);
        if let Some(previous) = frame.restore {
            let _ = CURRENT.try_with(|current| {
                if Arc::ptr_eq(&current.recorder, &frame.recorder) && current.parent.get() == frame.idx {
                    current.parent.set(previous);
                }
            });
        }
    }
}

const ROOT: usize = 0;

fn open_frame(function: &'static str, file: &'static str, line: u32, nest: bool) -> FrameGuard {
    let active = CURRENT
        .try_with(|current| {
            let parent = current.parent.get();
            let idx = current.recorder.enter(parent, function, file, line)?;
            let restore = nest.then(|| current.parent.replace(idx));
            Some(ActiveFrame {
                recorder: current.recorder.clone(),
                idx,
                restore,
            })
        })
        .ok()
        .flatten();
    FrameGuard { active }
}

/// Open a frame that nests the calls made until it is dropped.
pub(super) fn enter(function: &'static str, file: &'static str, line: u32) -> FrameGuard {
    open_frame(function, file, line, true)
}

/// Run `future` as one frame, with its own parent scope.
pub(super) async fn instrument<F: Future>(
    function: &'static str,
    file: &'static str,
    line: u32,
    future: F,
) -> F::Output {
    let guard = open_frame(function, file, line, false);
    match &guard.active {
        Some(frame) => {
            let scope = Current {
                recorder: frame.recorder.clone(),
                parent: Cell::new(frame.idx),
            };
            CURRENT.scope(scope, future).await
        }
        None => future.await,
    }
}

pub(super) fn is_active() -> bool {
    CURRENT.try_with(|_| ()).is_ok()
}
