// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The resumable-computation abstraction the rest of the crate is built on.
//!
//! A [`Coro`] is an explicit state machine, polled once per tick, that reports progress through
//! [`std::task::Poll`] and carries its own cancellation flag into `advance` rather than tunneling
//! cancellation through a side channel like an exception or a dropped value.

use crate::error::Error;
use std::fmt;
use std::task::Poll;

/// A computation that makes progress one `advance` call at a time.
///
/// Unlike [`std::future::Future`], advancing a `Coro` never registers a waker: the [`Loop`]
/// (crate::scheduler::Loop) simply re-polls every runnable task each tick. There is no
/// preemption and no parallelism (see the crate's non-goals), so a busy-poll scheduler is the
/// whole story; unlike `Future` there's no address-sensitive self-referential state either; a
/// `Coro` only ever holds other `Coro`s or plain owned data, so it never needs to be pinned.
pub trait Coro {
    /// The value produced on clean completion.
    type Output;

    /// Advance the computation by one step.
    ///
    /// `cancel` is `true` exactly when the owning task has been asked to cancel and this is the
    /// first advance after that request; implementations that park on a shared waiter deque
    /// (`Event`, `Lock`, `Queue`) must use this to unlink themselves before propagating
    /// [`Error::Cancelled`].
    fn advance(&mut self, cancel: bool) -> Poll<Result<Self::Output, Error>>;
}

impl<C: Coro + ?Sized> Coro for Box<C> {
    type Output = C::Output;

    fn advance(&mut self, cancel: bool) -> Poll<Result<Self::Output, Error>> {
        (**self).advance(cancel)
    }
}

/// Build a [`Coro`] from a closure, the way [`std::future::poll_fn`] builds a `Future`.
pub fn from_fn<T, F>(f: F) -> FromFn<F>
where
    F: FnMut(bool) -> Poll<Result<T, Error>>,
{
    FromFn(f)
}

/// [`Coro`] returned by [`from_fn`].
pub struct FromFn<F>(F);

impl<F> fmt::Debug for FromFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FromFn").finish_non_exhaustive()
    }
}

impl<T, F> Coro for FromFn<F>
where
    F: FnMut(bool) -> Poll<Result<T, Error>>,
{
    type Output = T;

    fn advance(&mut self, cancel: bool) -> Poll<Result<T, Error>> {
        (self.0)(cancel)
    }
}
