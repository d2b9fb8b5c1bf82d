// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Future`]: the write-once result cell every waiter deque in this crate is built from.

use crate::coro::Coro;
use crate::error::Error;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::task::Poll;

#[derive(Debug)]
struct Inner<T> {
    value: Option<T>,
}

/// A write-once cell that can be awaited.
///
/// `Future` is the fundamental parking primitive: a primitive that needs to suspend a task
/// creates one, hands the handle to whoever should resolve it, and has the task await it.
/// "Unset" and "set to a value that happens to look empty" are kept distinct by storing a real
/// `Option<T>` rather than a sentinel, so `done()` can never be fooled by the stored value.
#[derive(Debug)]
pub struct Future<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Future<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner { value: None })),
        }
    }

    /// Returns `true` once [`set_result`](Self::set_result) has been called.
    #[must_use]
    pub fn done(&self) -> bool {
        self.inner.borrow().value.is_some()
    }

    /// Resolve the future.
    ///
    /// # Panics
    ///
    /// Panics if the future was already set; this is a programming error, the same way setting
    /// a oneshot channel's value twice would be.
    pub fn set_result(&self, value: T) {
        let mut inner = self.inner.borrow_mut();
        assert!(inner.value.is_none(), "Future::set_result called twice");
        inner.value = Some(value);
    }

    /// Identity used by waiter deques to remove a specific, possibly-abandoned, waiter.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Coro for Future<T> {
    type Output = T;

    fn advance(&mut self, cancel: bool) -> Poll<Result<T, Error>> {
        if cancel {
            return Poll::Ready(Err(Error::Cancelled));
        }
        match self.inner.borrow_mut().value.take() {
            Some(value) => Poll::Ready(Ok(value)),
            None => Poll::Pending,
        }
    }
}

impl<T> fmt::Display for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Future({})", if self.done() { "set" } else { "unset" })
    }
}
