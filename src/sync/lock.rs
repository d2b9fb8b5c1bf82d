// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::coro::Coro;
use crate::error::Error;
use crate::future::Future;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::task::Poll;

struct State {
    locked: Cell<bool>,
    waiters: RefCell<VecDeque<Future<()>>>,
}

impl State {
    /// Hand the lock to the next live waiter, or mark it free if there is none.
    ///
    /// The handoff is atomic across the cooperative step boundary: `locked` stays `true` when a
    /// waiter is resolved here, so a task calling `acquire()` later in the same tick can never
    /// observe the lock as free while a woken waiter is still waiting for its own turn to run.
    /// Returns `true` iff a waiter was actually handed the lock.
    fn wake_next(&self) -> bool {
        let mut waiters = self.waiters.borrow_mut();
        while let Some(fut) = waiters.pop_front() {
            if !fut.done() {
                fut.set_result(());
                return true;
            }
        }
        self.locked.set(false);
        false
    }
}

/// A cooperative mutex: at most one holder at a time, oldest waiter served first on release.
///
/// This serializes access between *tasks* sharing the single-threaded loop, not between OS
/// threads -- there is nothing here an `AtomicBool` would buy you, since only one task ever runs
/// at a time. Like [`Event`](crate::sync::Event), `Lock` is a cheap-to-clone handle.
#[derive(Clone)]
pub struct Lock {
    state: Rc<State>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(State {
                locked: Cell::new(false),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    #[must_use]
    pub fn locked(&self) -> bool {
        self.state.locked.get()
    }

    /// Acquire the lock, parking behind any earlier waiter.
    ///
    /// Resolves to a [`LockGuard`] that releases the lock when dropped, so `release` is never
    /// forgotten on any exit path (early return, cancellation, panic).
    #[must_use]
    pub fn acquire(&self) -> Acquire {
        Acquire {
            lock: self.clone(),
            fut: None,
        }
    }

    /// Release the lock, waking the oldest waiter (if any). The waiter becomes the new holder
    /// on its own next step, not synchronously here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockNotAcquired`] if the lock is not currently held.
    pub fn release(&self) -> Result<(), Error> {
        if !self.state.locked.get() {
            return Err(Error::LockNotAcquired);
        }
        self.state.wake_next();
        Ok(())
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("locked", &self.state.locked.get())
            .field("waiters", &self.state.waiters.borrow().len())
            .finish()
    }
}

/// [`Coro`] returned by [`Lock::acquire`].
#[derive(Debug)]
pub struct Acquire {
    lock: Lock,
    fut: Option<Future<()>>,
}

impl Coro for Acquire {
    type Output = LockGuard;

    fn advance(&mut self, cancel: bool) -> Poll<Result<LockGuard, Error>> {
        if cancel {
            if let Some(fut) = self.fut.take() {
                // If our Future was already resolved, a racing `release` handed the lock to us
                // specifically (see `State::wake_next`) and `locked` is still `true` on our
                // behalf. We're declining it, so pass it on to the next waiter (or free it)
                // instead of leaking a permanently-held lock with nobody to release it.
                let was_handed_off = fut.done();
                self.lock.state.waiters.borrow_mut().retain(|w| !w.ptr_eq(&fut));
                if was_handed_off {
                    self.lock.state.wake_next();
                }
            }
            return Poll::Ready(Err(Error::Cancelled));
        }

        if self.fut.is_none() {
            if !self.lock.state.locked.get() && self.lock.state.waiters.borrow().is_empty() {
                self.lock.state.locked.set(true);
                return Poll::Ready(Ok(LockGuard {
                    lock: self.lock.clone(),
                }));
            }
            let fut = Future::new();
            tracing::trace!(
                waiters = self.lock.state.waiters.borrow().len() + 1,
                "parking on contended lock"
            );
            self.lock.state.waiters.borrow_mut().push_back(fut.clone());
            self.fut = Some(fut);
        }

        match self.fut.as_mut().expect("just inserted above").advance(false) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                // `wake_next` already left `locked` set to `true` on our behalf; this is the
                // atomic handoff, not a fresh acquisition.
                self.fut = None;
                Poll::Ready(Ok(LockGuard {
                    lock: self.lock.clone(),
                }))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }
}

/// RAII guard returned by a completed [`Acquire`]; releases the lock on drop.
#[must_use = "the lock is released when this guard is dropped"]
pub struct LockGuard {
    lock: Lock,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.lock.release();
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::from_fn;
    use crate::scheduler::Loop;

    #[test]
    fn waiters_enter_critical_section_in_fifo_order() {
        let lp = Loop::new();
        let lock = Lock::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for id in 0..3 {
            let lock = lock.clone();
            let order = order.clone();
            let mut acquire = lock.acquire();
            let mut guard: Option<LockGuard> = None;
            let mut parked_once = false;
            lp.create_task(from_fn(move |cancel| {
                if guard.is_none() {
                    match acquire.advance(cancel) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(g)) => guard = Some(g),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    }
                }
                if !parked_once {
                    parked_once = true;
                    return Poll::Pending;
                }
                order.borrow_mut().push(id);
                guard.take();
                Poll::Ready(Ok(()))
            }));
        }

        for _ in 0..10 {
            lp.tick().unwrap();
        }

        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn release_without_acquire_errors() {
        let lock = Lock::new();
        assert!(matches!(lock.release(), Err(Error::LockNotAcquired)));
    }

    /// Regression test: a release must hand the lock to the woken waiter atomically, so a task
    /// calling `acquire()` for the first time in the same tick can never steal it out from under
    /// the waiter that was already promised it.
    #[test]
    fn release_handoff_is_atomic_against_a_racing_new_acquirer() {
        let lp = Loop::new();
        let lock = Lock::new();
        let concurrent = Rc::new(Cell::new(0usize));
        let max_concurrent = Rc::new(Cell::new(0usize));

        // Task A: acquires uncontended, pauses once while holding the guard, then releases.
        {
            let mut acquire = lock.acquire();
            let mut guard: Option<LockGuard> = None;
            let mut parked = false;
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            lp.create_task(from_fn(move |cancel| {
                if guard.is_none() {
                    match acquire.advance(cancel) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(g)) => {
                            guard = Some(g);
                            let n = concurrent.get() + 1;
                            concurrent.set(n);
                            max_concurrent.set(max_concurrent.get().max(n));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    }
                }
                if !parked {
                    parked = true;
                    return Poll::Pending;
                }
                concurrent.set(concurrent.get() - 1);
                guard.take();
                Poll::Ready(Ok(()))
            }));
        }

        // Task B: parks behind A on its very first step, becomes the lock's single waiter.
        {
            let mut acquire = lock.acquire();
            let mut guard: Option<LockGuard> = None;
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            lp.create_task(from_fn(move |cancel| {
                if guard.is_none() {
                    match acquire.advance(cancel) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(g)) => {
                            guard = Some(g);
                            let n = concurrent.get() + 1;
                            concurrent.set(n);
                            max_concurrent.set(max_concurrent.get().max(n));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    }
                }
                concurrent.set(concurrent.get() - 1);
                guard.take();
                Poll::Ready(Ok(()))
            }));
        }

        // Task C: idles for one step, then calls `acquire()` for the first time on its second
        // step -- the same tick A releases and hands the lock to B.
        {
            let lock = lock.clone();
            let mut acquire: Option<Acquire> = None;
            let mut guard: Option<LockGuard> = None;
            let mut idled = false;
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            lp.create_task(from_fn(move |cancel| {
                if guard.is_none() {
                    if acquire.is_none() {
                        if !idled {
                            idled = true;
                            return Poll::Pending;
                        }
                        acquire = Some(lock.acquire());
                    }
                    match acquire.as_mut().expect("just inserted above").advance(cancel) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(g)) => {
                            guard = Some(g);
                            let n = concurrent.get() + 1;
                            concurrent.set(n);
                            max_concurrent.set(max_concurrent.get().max(n));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    }
                }
                concurrent.set(concurrent.get() - 1);
                guard.take();
                Poll::Ready(Ok(()))
            }));
        }

        for _ in 0..20 {
            lp.tick().unwrap();
        }

        assert_eq!(max_concurrent.get(), 1);
    }
}
