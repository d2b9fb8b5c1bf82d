// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::coro::Coro;
use crate::error::Error;
use crate::future::Future;
use crate::sync::event::{Event, Wait};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::task::Poll;

struct State<T> {
    maxsize: usize,
    items: RefCell<VecDeque<T>>,
    getters: RefCell<VecDeque<Future<()>>>,
    putters: RefCell<VecDeque<Future<()>>>,
    unfinished_tasks: Cell<usize>,
    finished: Event,
}

impl<T> State<T> {
    fn full(&self) -> bool {
        self.maxsize != 0 && self.items.borrow().len() >= self.maxsize
    }

    /// Pop futures off the head until one is found not yet resolved (covers futures abandoned
    /// by cancellation), and resolve it.
    fn wake_next(&self, waiters: &RefCell<VecDeque<Future<()>>>) {
        let mut w = waiters.borrow_mut();
        while let Some(fut) = w.pop_front() {
            if !fut.done() {
                fut.set_result(());
                break;
            }
        }
    }
}

/// A FIFO queue with optional backpressure.
///
/// `maxsize == 0` means unbounded. Like the other synchronization primitives in this crate,
/// `Queue` is a cheap-to-clone handle shared between producer and consumer tasks.
#[derive(Clone)]
pub struct Queue<T> {
    state: Rc<State<T>>,
}

impl<T> Queue<T> {
    #[must_use]
    pub fn new(maxsize: usize) -> Self {
        let finished = Event::new();
        finished.set();
        Self {
            state: Rc::new(State {
                maxsize,
                items: RefCell::new(VecDeque::new()),
                getters: RefCell::new(VecDeque::new()),
                putters: RefCell::new(VecDeque::new()),
                unfinished_tasks: Cell::new(0),
                finished,
            }),
        }
    }

    #[must_use]
    pub fn maxsize(&self) -> usize {
        self.state.maxsize
    }

    #[must_use]
    pub fn qsize(&self) -> usize {
        self.state.items.borrow().len()
    }

    #[must_use]
    pub fn empty(&self) -> bool {
        self.state.items.borrow().is_empty()
    }

    #[must_use]
    pub fn full(&self) -> bool {
        self.state.full()
    }

    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if the queue is already at `maxsize`.
    pub fn put_nowait(&self, item: T) -> Result<(), Error> {
        if self.state.full() {
            return Err(Error::QueueFull);
        }
        self.state.items.borrow_mut().push_back(item);
        self.state
            .unfinished_tasks
            .set(self.state.unfinished_tasks.get() + 1);
        self.state.finished.clear();
        self.state.wake_next(&self.state.getters);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::QueueEmpty`] if the queue has no items.
    pub fn get_nowait(&self) -> Result<T, Error> {
        let item = self
            .state
            .items
            .borrow_mut()
            .pop_front()
            .ok_or(Error::QueueEmpty)?;
        self.state.wake_next(&self.state.putters);
        Ok(item)
    }

    #[must_use]
    pub fn put(&self, item: T) -> Put<T> {
        Put {
            queue: self.clone(),
            item: Some(item),
            fut: None,
        }
    }

    #[must_use]
    pub fn get(&self) -> Get<T> {
        Get {
            queue: self.clone(),
            fut: None,
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::TaskDoneUnderflow`] if called more times than items were ever put.
    pub fn task_done(&self) -> Result<(), Error> {
        let remaining = self.state.unfinished_tasks.get();
        if remaining == 0 {
            return Err(Error::TaskDoneUnderflow);
        }
        self.state.unfinished_tasks.set(remaining - 1);
        if remaining - 1 == 0 {
            self.state.finished.set();
        }
        Ok(())
    }

    #[must_use]
    pub fn join(&self) -> Join<T> {
        Join {
            queue: self.clone(),
            wait: None,
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("maxsize", &self.state.maxsize)
            .field("qsize", &self.qsize())
            .field("unfinished_tasks", &self.state.unfinished_tasks.get())
            .finish()
    }
}

/// [`Coro`] returned by [`Queue::put`].
pub struct Put<T> {
    queue: Queue<T>,
    item: Option<T>,
    fut: Option<Future<()>>,
}

impl<T> fmt::Debug for Put<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Put")
            .field("queue", &self.queue)
            .field("has_item", &self.item.is_some())
            .field("parked", &self.fut.is_some())
            .finish()
    }
}

impl<T> Coro for Put<T> {
    type Output = ();

    fn advance(&mut self, cancel: bool) -> Poll<Result<(), Error>> {
        if cancel {
            if let Some(fut) = self.fut.take() {
                // Resolve defensively so no stale, unresolved entry lingers if something else
                // already removed it from the deque (e.g. a `get_nowait` wake-up race).
                fut.set_result(());
                self.queue
                    .state
                    .putters
                    .borrow_mut()
                    .retain(|w| !w.ptr_eq(&fut));
                if !self.queue.state.full() {
                    self.queue.state.wake_next(&self.queue.state.putters);
                }
            }
            return Poll::Ready(Err(Error::Cancelled));
        }

        loop {
            if self.fut.is_none() {
                if !self.queue.state.full() {
                    let item = self.item.take().expect("Put polled after completion");
                    return Poll::Ready(
                        self.queue
                            .put_nowait(item)
                            .map_err(|_| unreachable!("just checked full()")),
                    );
                }
                let fut = Future::new();
                self.queue.state.putters.borrow_mut().push_back(fut.clone());
                self.fut = Some(fut);
            }

            match self.fut.as_mut().expect("just inserted above").advance(false) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => {
                    self.fut = None; // retry: re-check full() now that we were woken
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            }
        }
    }
}

/// [`Coro`] returned by [`Queue::get`].
pub struct Get<T> {
    queue: Queue<T>,
    fut: Option<Future<()>>,
}

impl<T> fmt::Debug for Get<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Get")
            .field("queue", &self.queue)
            .field("parked", &self.fut.is_some())
            .finish()
    }
}

impl<T> Coro for Get<T> {
    type Output = T;

    fn advance(&mut self, cancel: bool) -> Poll<Result<T, Error>> {
        if cancel {
            if let Some(fut) = self.fut.take() {
                fut.set_result(());
                self.queue
                    .state
                    .getters
                    .borrow_mut()
                    .retain(|w| !w.ptr_eq(&fut));
                if !self.queue.empty() {
                    self.queue.state.wake_next(&self.queue.state.getters);
                }
            }
            return Poll::Ready(Err(Error::Cancelled));
        }

        loop {
            if self.fut.is_none() {
                if !self.queue.empty() {
                    return Poll::Ready(
                        self.queue
                            .get_nowait()
                            .map_err(|_| unreachable!("just checked empty()")),
                    );
                }
                let fut = Future::new();
                self.queue.state.getters.borrow_mut().push_back(fut.clone());
                self.fut = Some(fut);
            }

            match self.fut.as_mut().expect("just inserted above").advance(false) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => {
                    self.fut = None;
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            }
        }
    }
}

/// [`Coro`] returned by [`Queue::join`].
pub struct Join<T> {
    queue: Queue<T>,
    wait: Option<Wait>,
}

impl<T> fmt::Debug for Join<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Join")
            .field("queue", &self.queue)
            .field("waiting", &self.wait.is_some())
            .finish()
    }
}

impl<T> Coro for Join<T> {
    type Output = ();

    fn advance(&mut self, cancel: bool) -> Poll<Result<(), Error>> {
        if self.queue.state.unfinished_tasks.get() == 0 {
            return Poll::Ready(Ok(()));
        }
        if self.wait.is_none() {
            self.wait = Some(self.queue.state.finished.wait());
        }
        match self.wait.as_mut().expect("just inserted above").advance(cancel) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
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
    fn bounded_queue_backpressures_the_producer() {
        let lp = Loop::new();
        let queue: Queue<i32> = Queue::new(1);

        let consumed = Rc::new(RefCell::new(Vec::new()));

        let pq = queue.clone();
        let mut items = vec![1, 2, 3].into_iter();
        let mut put: Option<Put<i32>> = None;
        lp.create_task(from_fn(move |cancel| loop {
            if put.is_none() {
                match items.next() {
                    Some(item) => put = Some(pq.put(item)),
                    None => return Poll::Ready(Ok(())),
                }
            }
            match put.as_mut().unwrap().advance(cancel) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => put = None,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            }
        }));

        let gq = queue.clone();
        let results = consumed.clone();
        let mut get: Option<Get<i32>> = None;
        let mut paused_once = false;
        lp.create_task(from_fn(move |cancel| {
            if !paused_once {
                paused_once = true;
                return Poll::Pending;
            }
            if get.is_none() {
                get = Some(gq.get());
            }
            match get.as_mut().unwrap().advance(cancel) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(item)) => {
                    results.borrow_mut().push(item);
                    get = None;
                    if results.borrow().len() == 3 {
                        Poll::Ready(Ok(()))
                    } else {
                        Poll::Pending
                    }
                }
                Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            }
        }));

        for _ in 0..20 {
            lp.tick().unwrap();
            if *consumed.borrow() == vec![1, 2, 3] {
                break;
            }
        }

        assert_eq!(*consumed.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn accounting_never_underflows_and_finished_tracks_it() {
        let queue: Queue<()> = Queue::new(0);
        assert!(queue.state.finished.is_set());
        queue.put_nowait(()).unwrap();
        assert!(!queue.state.finished.is_set());
        assert!(matches!(queue.task_done(), Ok(())));
        assert!(queue.state.finished.is_set());
        assert!(matches!(queue.task_done(), Err(Error::TaskDoneUnderflow)));
    }
}
