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
    value: Cell<bool>,
    waiters: RefCell<VecDeque<Future<()>>>,
}

/// A boolean latch with a FIFO waiter deque.
///
/// `set` resolves and drains every waiter parked so far, in enqueue order; `clear` resets the
/// latch without disturbing already-resolved waiters. `Event` is a cheap-to-clone handle (like
/// [`Loop`](crate::scheduler::Loop)): clones share the same latch and waiter deque, which is how
/// it is shared between the tasks that wait on it and the task that sets it.
#[derive(Clone)]
pub struct Event {
    state: Rc<State>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(State {
                value: Cell::new(false),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.value.get()
    }

    /// Set the latch. A no-op if already set.
    ///
    /// Every waiter parked so far is resolved *and* drained from the queue, so a later `clear`
    /// followed by fresh `wait` calls never revisits an already-resolved `Future`.
    pub fn set(&self) {
        if self.state.value.replace(true) {
            return;
        }
        for fut in self.state.waiters.borrow_mut().drain(..) {
            if !fut.done() {
                fut.set_result(());
            }
        }
    }

    /// Reset the latch to unset. Outstanding waits are not cancelled.
    pub fn clear(&self) {
        self.state.value.set(false);
    }

    #[must_use]
    pub fn wait(&self) -> Wait {
        Wait {
            event: self.clone(),
            fut: None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("value", &self.state.value.get())
            .field("waiters", &self.state.waiters.borrow().len())
            .finish()
    }
}

/// [`Coro`] returned by [`Event::wait`].
#[derive(Debug)]
pub struct Wait {
    event: Event,
    fut: Option<Future<()>>,
}

impl Coro for Wait {
    type Output = bool;

    fn advance(&mut self, cancel: bool) -> Poll<Result<bool, Error>> {
        if cancel {
            if let Some(fut) = self.fut.take() {
                self.event
                    .state
                    .waiters
                    .borrow_mut()
                    .retain(|w| !w.ptr_eq(&fut));
            }
            return Poll::Ready(Err(Error::Cancelled));
        }

        if self.fut.is_none() {
            if self.event.is_set() {
                return Poll::Ready(Ok(true));
            }
            let fut = Future::new();
            self.event.state.waiters.borrow_mut().push_back(fut.clone());
            self.fut = Some(fut);
        }

        match self.fut.as_mut().expect("just inserted above").advance(false) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                self.fut = None;
                Poll::Ready(Ok(true))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::from_fn;
    use crate::scheduler::Loop;

    #[test]
    fn broadcast_wakes_both_waiters_in_the_set_tick() {
        let lp = Loop::new();
        let event = Event::new();

        let e1 = event.clone();
        let mut wait1 = e1.wait();
        let w1 = lp.create_task(from_fn(move |cancel| wait1.advance(cancel)));

        let e2 = event.clone();
        let mut wait2 = e2.wait();
        let w2 = lp.create_task(from_fn(move |cancel| wait2.advance(cancel)));

        lp.tick().unwrap(); // admits w1/w2, parks both
        assert!(!w1.done());
        assert!(!w2.done());

        event.set();
        lp.tick().unwrap();

        assert_eq!(w1.take_result(), Some(true));
        assert_eq!(w2.take_result(), Some(true));
    }

    #[test]
    fn set_is_idempotent_after_clear() {
        let event = Event::new();
        event.set();
        event.clear();
        assert!(!event.is_set());
        event.set();
        assert!(event.is_set());
    }

    #[test]
    fn cancelled_waiter_is_unlinked() {
        let event = Event::new();
        let mut wait = event.wait();
        assert!(wait.advance(false).is_pending());
        assert_eq!(event.state.waiters.borrow().len(), 1);
        assert!(wait.advance(true).is_ready());
        assert_eq!(event.state.waiters.borrow().len(), 0);
        // A subsequent set() must be a safe no-op, not panic or double-resolve anything.
        event.set();
    }
}
