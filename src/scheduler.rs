// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Loop`]: the single-threaded scheduler that drives admitted tasks to completion.

use crate::coro::Coro;
use crate::current;
use crate::error::Error;
use crate::task::{ErasedTask, Id, Status, Task};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

struct State {
    /// Admitted, non-terminal tasks, in FIFO processing order.
    running: RefCell<Vec<Box<dyn ErasedTask>>>,
    /// Tasks admitted during the tick in progress; merged into `running` at the start of the
    /// next tick.
    to_add: RefCell<Vec<Box<dyn ErasedTask>>>,
}

/// The event loop: admits tasks, advances each runnable task by one step per tick, and retires
/// completed ones.
///
/// `Loop` is cheap to clone -- clones share the same admitted task set, which is how the ambient
/// "current loop" slot in [`crate::current`] hands a live handle to primitives that need to
/// register waiters or spawn tasks without threading a `&Loop` through every call.
#[derive(Clone)]
pub struct Loop {
    state: Rc<State>,
}

impl Default for Loop {
    fn default() -> Self {
        Self::new()
    }
}

impl Loop {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(State {
                running: RefCell::new(Vec::new()),
                to_add: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Wrap `coro` in a fresh [`Task`] and stage it for admission on the next tick.
    ///
    /// The task is *not* advanced synchronously; it starts running on the next call to
    /// [`tick`](Self::tick).
    pub fn create_task<T: 'static>(&self, coro: impl Coro<Output = T> + 'static) -> Task<T> {
        let task = Task::new(coro);
        tracing::trace!(id = %task.id(), "admitting task");
        task.mark_admitted(self);
        task
    }

    /// Admit an existing [`Task`], if it hasn't been admitted already.
    ///
    /// Re-admitting a task that is already running (or already finished) is a no-op: the same
    /// handle is returned either way.
    pub fn spawn_task<T: 'static>(&self, task: Task<T>) -> Task<T> {
        task.mark_admitted(self);
        task
    }

    pub(crate) fn add_task(&self, task: Box<dyn ErasedTask>) {
        self.state.to_add.borrow_mut().push(task);
    }

    /// Run exactly one scheduling step.
    ///
    /// 1. Drains `to_add` into `running`.
    /// 2. Advances every still-`Pending` task in `running`, in admission order, by one step.
    /// 3. Fires done-callbacks for tasks that just became terminal, then removes them.
    ///
    /// # Errors
    ///
    /// If a task's coroutine surfaces an error other than completing cleanly, the sweep stops
    /// immediately and that error propagates out of `tick`, aborting the rest of this tick (the
    /// task's own status is left `Pending`; only clean completion is handled specially here).
    pub fn tick(&self) -> Result<Vec<Id>, Error> {
        {
            let mut to_add = self.state.to_add.borrow_mut();
            if !to_add.is_empty() {
                self.state.running.borrow_mut().append(&mut to_add);
            }
        }

        let count = self.state.running.borrow().len();
        let mut terminal = Vec::new();
        for i in 0..count {
            let pending = {
                let running = self.state.running.borrow();
                running.get(i).is_some_and(|t| t.status() == Status::Pending)
            };
            if pending {
                let running = self.state.running.borrow();
                running[i].step()?;
            }
            let is_terminal = {
                let running = self.state.running.borrow();
                running
                    .get(i)
                    .is_some_and(|t| t.status() != Status::Pending)
            };
            if is_terminal {
                terminal.push(i);
            }
        }

        let mut done = Vec::with_capacity(terminal.len());
        {
            let running = self.state.running.borrow();
            for &i in &terminal {
                let task = &running[i];
                tracing::trace!(id = %task.id(), status = ?task.status(), "task terminated");
                task.fire_callbacks();
                done.push(task.id());
            }
        }
        {
            let mut running = self.state.running.borrow_mut();
            for &i in terminal.iter().rev() {
                running.remove(i);
            }
        }

        Ok(done)
    }

    /// Publish `self` as the running loop, then tick forever.
    ///
    /// Only returns by propagating an error out of [`tick`](Self::tick).
    pub fn run_forever(&self) -> Result<(), Error> {
        let _guard = current::enter(self);
        loop {
            self.tick()?;
        }
    }

    /// Publish `self` as the running loop, admit `coro` as the root task, and tick until it is
    /// done. Cancels every other still-running task before returning.
    ///
    /// # Errors
    ///
    /// Propagates any error raised while ticking, or [`Error::Cancelled`] if the root task was
    /// cancelled out from under the caller.
    pub fn run_until_complete<T: 'static>(
        &self,
        coro: impl Coro<Output = T> + 'static,
    ) -> Result<T, Error> {
        let _guard = current::enter(self);
        let task = self.create_task(coro);

        let run = || -> Result<(), Error> {
            while !task.done() {
                self.tick()?;
            }
            Ok(())
        };
        let outcome = run();

        self.cancel_all()?;
        outcome?;

        match task.status() {
            Status::Finished => Ok(task
                .take_result()
                .expect("a Finished task always retains its result")),
            Status::Cancelled | Status::Pending => Err(Error::Cancelled),
        }
    }

    /// Inject cancellation into every task still admitted, then tick once more so their
    /// coroutines can unwind and be reaped.
    pub fn cancel_all(&self) -> Result<(), Error> {
        {
            let running = self.state.running.borrow();
            tracing::debug!(count = running.len(), "cancelling all running tasks");
            for task in running.iter() {
                task.cancel();
            }
        }
        self.tick()?;
        Ok(())
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("running", &self.state.running.borrow().len())
            .field("to_add", &self.state.to_add.borrow().len())
            .finish()
    }
}
