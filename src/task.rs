// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Task`]: the scheduler handle wrapped around a [`Coro`].

mod id;

pub use id::Id;

use crate::coro::Coro;
use crate::error::Error;
use crate::scheduler::Loop;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::rc::Rc;
use std::task::Poll;

/// Where a [`Task`] is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Pending,
    Finished,
    Cancelled,
}

struct Inner<T> {
    id: Id,
    status: Status,
    coro: Box<dyn Coro<Output = T>>,
    result: Option<T>,
    callbacks: Vec<Box<dyn FnOnce(&Task<T>)>>,
    /// Set once this task has been handed to a [`Loop`]'s `to_add`, so a second
    /// `create_task`/`spawn_task` call on the same handle doesn't admit it twice.
    admitted: Cell<bool>,
}

/// A uniquely-identified handle around a running (or finished) [`Coro`].
///
/// `Task` is cheap to clone: clones are handles to the same underlying computation, compare
/// equal, and hash the same (identity is entirely by [`Id`]). A `Task` is only ever advanced by
/// the [`Loop`] it was admitted to.
pub struct Task<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Task<T> {
    pub(crate) fn new(coro: impl Coro<Output = T> + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                id: Id::next(),
                status: Status::Pending,
                coro: Box::new(coro),
                result: None,
                callbacks: Vec::new(),
                admitted: Cell::new(false),
            })),
        }
    }

    #[must_use]
    pub fn id(&self) -> Id {
        self.inner.borrow().id
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.borrow().status
    }

    /// `true` once the task has reached `Finished` or `Cancelled`.
    #[must_use]
    pub fn done(&self) -> bool {
        !matches!(self.status(), Status::Pending)
    }

    /// Take the task's stored result, if it finished cleanly.
    ///
    /// The result is write-once from the task's perspective: whoever observes completion first
    /// (a done-callback, `run_until_complete`, `gather`, or a coroutine composing on this task)
    /// takes it. Returns `None` both before completion and after the result has already been
    /// taken.
    pub fn take_result(&self) -> Option<T> {
        self.inner.borrow_mut().result.take()
    }

    /// Register a callback to run once this task reaches a terminal status.
    ///
    /// Callbacks run in registration order, in the tick that observes termination (see
    /// [`Loop::tick`]). If the task is already terminal, the callback runs immediately.
    pub fn add_done_callback(&self, callback: impl FnOnce(&Task<T>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        if inner.status == Status::Pending {
            inner.callbacks.push(Box::new(callback));
        } else {
            drop(inner);
            callback(self);
        }
    }

    /// Inject cancellation into the task's coroutine at its current pause point.
    ///
    /// The coroutine may run unwinding code (removing itself from a waiter deque, promoting a
    /// successor waiter) before the cancellation propagates. After this call the task's status
    /// is `Cancelled` and the owning `Loop` will not advance it further.
    pub fn cancel(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.status != Status::Pending {
            return;
        }
        tracing::trace!(id = %inner.id, "cancelling task");
        inner.status = Status::Cancelled;
        let _ = inner.coro.advance(true);
    }

    pub(crate) fn mark_admitted(&self, lp: &Loop) {
        let inner = self.inner.borrow();
        if !inner.admitted.replace(true) {
            drop(inner);
            lp.add_task(Box::new(Runnable(self.clone())));
        }
    }

    /// Advance the coroutine by one non-cancelling step. Only called by the owning `Loop`.
    fn step(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.status != Status::Pending {
            return Ok(());
        }
        match inner.coro.advance(false) {
            Poll::Pending => Ok(()),
            Poll::Ready(Ok(value)) => {
                inner.result = Some(value);
                inner.status = Status::Finished;
                Ok(())
            }
            Poll::Ready(Err(err)) => Err(err),
        }
    }

    fn fire_callbacks(&self) {
        let callbacks = mem::take(&mut self.inner.borrow_mut().callbacks);
        for cb in callbacks {
            cb(self);
        }
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for Task<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<T> Eq for Task<T> {}

impl<T> Hash for Task<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

/// Type-erased handle the [`Loop`] uses to advance and reap tasks without knowing their
/// output type.
pub(crate) trait ErasedTask {
    fn id(&self) -> Id;
    fn status(&self) -> Status;
    fn step(&self) -> Result<(), Error>;
    fn cancel(&self);
    fn fire_callbacks(&self);
}

struct Runnable<T>(Task<T>);

impl<T> ErasedTask for Runnable<T> {
    fn id(&self) -> Id {
        self.0.id()
    }

    fn status(&self) -> Status {
        self.0.status()
    }

    fn step(&self) -> Result<(), Error> {
        self.0.step()
    }

    fn cancel(&self) {
        self.0.cancel();
    }

    fn fire_callbacks(&self) {
        self.0.fire_callbacks();
    }
}

/// A [`Coro`] that waits on another [`Task`], forwarding pauses until the callee completes.
///
/// This is the composition rule from the task model: a coroutine that needs to `await` a task
/// (rather than poll `Task::done` itself, as `gather` does) wraps it in `AwaitTask`. Cancelling
/// the wrapper cancels the wrapped task.
pub struct AwaitTask<T>(Task<T>);

impl<T> AwaitTask<T> {
    #[must_use]
    pub fn new(task: Task<T>) -> Self {
        Self(task)
    }
}

impl<T> Coro for AwaitTask<T> {
    type Output = T;

    fn advance(&mut self, cancel: bool) -> Poll<Result<T, Error>> {
        if cancel {
            self.0.cancel();
            return Poll::Ready(Err(Error::Cancelled));
        }
        match self.0.status() {
            Status::Pending => Poll::Pending,
            Status::Finished => Poll::Ready(Ok(self
                .0
                .take_result()
                .expect("a Finished task always has a stored result"))),
            Status::Cancelled => Poll::Ready(Err(Error::Cancelled)),
        }
    }
}
