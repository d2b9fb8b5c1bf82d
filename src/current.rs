// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide "currently running loop" slot.
//!
//! Primitives that need to register a waiter or admit a task (`Event`, `Lock`, `Queue`,
//! `gather`, `create_task`) look the running [`Loop`] up here rather than threading a reference
//! through every call. The slot is a stack rather than a single cell so a `Loop` running inside
//! another `Loop`'s task (unusual, but not forbidden) sees itself as current; the top of the
//! stack is always the one running loop.

use crate::scheduler::Loop;
use std::cell::RefCell;

thread_local! {
    static CURRENT: RefCell<Vec<Loop>> = const { RefCell::new(Vec::new()) };
}

/// Publishes `lp` as the running loop until the returned guard is dropped.
#[must_use]
pub(crate) fn enter(lp: &Loop) -> Guard {
    CURRENT.with(|c| c.borrow_mut().push(lp.clone()));
    Guard
}

pub(crate) struct Guard;

impl Drop for Guard {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            c.borrow_mut().pop();
        });
    }
}

/// Returns the running loop, if one has been entered via `run`/`run_until_complete`/`run_forever`.
#[must_use]
pub fn try_current() -> Option<Loop> {
    CURRENT.with(|c| c.borrow().last().cloned())
}

/// Returns the running loop.
///
/// # Errors
///
/// Returns [`Error::NoRunningLoop`](crate::error::Error::NoRunningLoop) if no loop is running.
pub fn current() -> Result<Loop, crate::error::Error> {
    try_current().ok_or(crate::error::Error::NoRunningLoop)
}
