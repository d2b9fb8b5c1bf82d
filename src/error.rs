// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The error taxonomy shared by every component in this crate.
//!
//! Everything that can go wrong while driving a [`Coro`](crate::coro::Coro) to completion is
//! folded into a single [`Error`] enum. Primitives raise the specific variant that applies;
//! `Loop::tick` and the composition rules in [`crate::task`] just forward it to whoever is
//! awaiting.

use crate::task::Id;
use std::fmt;

/// Something went wrong while advancing a task or using a synchronization primitive.
#[derive(Debug)]
pub enum Error {
    /// A primitive that requires the ambient running loop was used outside of `run`/
    /// `run_until_complete`/`run_forever`.
    NoRunningLoop,
    /// Cancellation was injected into a [`Coro`](crate::coro::Coro) at its current pause point.
    ///
    /// Expected to propagate up through composed coroutines unless a primitive explicitly
    /// neutralizes it during its unwind (e.g. to hand a `Lock` to the next waiter).
    Cancelled,
    /// `put`/`put_nowait` was attempted against a `Queue` that is already at `maxsize`.
    QueueFull,
    /// `get_nowait` was attempted against a `Queue` with no items.
    QueueEmpty,
    /// `Queue::task_done` was called more times than items were ever put on the queue.
    TaskDoneUnderflow,
    /// `Lock::release` was called on a `Lock` that is not held.
    LockNotAcquired,
    /// A timed wait (`gather`, a socket readiness wait) exceeded its deadline.
    ///
    /// Names the tasks that were still pending when the deadline passed, where applicable.
    Timeout { pending: Vec<Id> },
    /// The underlying OS socket call failed for a reason other than `EAGAIN`/`EINPROGRESS`.
    Socket(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoRunningLoop => f.write_str("no running loop"),
            Error::Cancelled => f.write_str("task was cancelled"),
            Error::QueueFull => f.write_str("queue is full"),
            Error::QueueEmpty => f.write_str("queue is empty"),
            Error::TaskDoneUnderflow => f.write_str("task_done() called too many times"),
            Error::LockNotAcquired => f.write_str("lock is not acquired"),
            Error::Timeout { pending } => {
                write!(f, "timeout on tasks: {pending:?}")
            }
            Error::Socket(err) => write!(f, "socket error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Socket(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Socket(err)
    }
}
