// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Location and backtrace of handler panics.
//!
//! A panic payload carries only the message. The location and stack are only
//! visible to the panic hook, so a hook chained in front of the existing one
//! records them for panics raised while a handler is being polled. Panics
//! elsewhere in the process are passed through untouched.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::pin;
use std::sync::Once;

use futures::FutureExt;
use futures::future::poll_fn;

/// Where a panic was raised and the stack at that point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PanicDetails {
    /// `file:line:column`
    pub(crate) location: Option<String>,
    pub(crate) backtrace: String,
}

thread_local! {
    static CAPTURING: Cell<usize> = const { Cell::new(0) };
    static LAST_PANIC: RefCell<Option<PanicDetails>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) > 0 {
                let details = PanicDetails {
                    location: info
                        .location()
                        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
                    backtrace: Backtrace::force_capture().to_string(),
                };
                LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(details));
            }
            previous(info);
        }));
    });
}

struct Capturing;

impl Capturing {
    fn enter() -> Self {
        CAPTURING.with(|c| c.set(c.get() + 1));
        Capturing
    }
}

impl Drop for Capturing {
    fn drop(&mut self) {
        CAPTURING.with(|c| c.set(c.get().saturating_sub(1)));
    }
}

/// Poll `future` to completion, catching a panic together with its details.
///
/// Every poll runs with capture enabled on the polling thread, so the future
/// may move between worker threads.
pub(crate) async fn catch_panic<F: Future>(
    future: F,
) -> Result<F::Output, (Box<dyn std::any::Any + Send>, Option<PanicDetails>)> {
    install_hook();
    let mut future = pin!(AssertUnwindSafe(future).catch_unwind());
    poll_fn(|cx| {
        let _capturing = Capturing::enter();
        future.as_mut().poll(cx).map(|result| {
            let details = LAST_PANIC.with(|slot| slot.borrow_mut().take());
            result.map_err(|payload| (payload, details))
        })
    })
    .await
}
