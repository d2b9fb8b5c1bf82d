// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured helpers built on top of [`Loop`]/[`Task`]: `gather`, `run`, `create_task`.

use crate::coro::Coro;
use crate::current;
use crate::error::Error;
use crate::scheduler::Loop;
use crate::task::{Id, Task};
use std::fmt;
use std::task::Poll;
use std::time::{Duration, Instant};

/// Accepts either a fresh [`Coro`] or an already-admitted [`Task`] wherever the API needs to
/// produce a `Task` to track.
///
/// A coroutine and a `Task<T>` aren't the same type, but both `gather` and `create_task` want to
/// treat them uniformly: wrap the former in a new `Task`, pass the latter through. Task isn't
/// given a direct `Coro` impl (that would make `impl<C: Coro> IntoTask for C` and
/// `impl IntoTask for Task<T>` overlap); this trait is the seam instead.
pub trait IntoTask<T> {
    fn into_task(self, lp: &Loop) -> Task<T>;
}

impl<T: 'static> IntoTask<T> for Task<T> {
    fn into_task(self, lp: &Loop) -> Task<T> {
        lp.spawn_task(self)
    }
}

impl<C> IntoTask<C::Output> for C
where
    C: Coro + 'static,
{
    fn into_task(self, lp: &Loop) -> Task<C::Output> {
        lp.create_task(self)
    }
}

/// Return the running loop if one exists, otherwise a fresh one.
fn loop_for_run() -> Loop {
    current::try_current().unwrap_or_default()
}

/// Drive `coro_or_task` to completion on the running loop (or a fresh one if none is running).
///
/// # Errors
///
/// Propagates any error the underlying [`Loop::run_until_complete`] returns.
pub fn run<T: 'static>(coro_or_task: impl IntoTask<T>) -> Result<T, Error> {
    let lp = loop_for_run();
    let task = coro_or_task.into_task(&lp);
    lp.run_until_complete(crate::task::AwaitTask::new(task))
}

/// Admit `coro_or_task` on the running loop (or a fresh one if none is running) and return its
/// handle.
#[must_use]
pub fn create_task<T: 'static>(coro_or_task: impl IntoTask<T>) -> Task<T> {
    let lp = loop_for_run();
    coro_or_task.into_task(&lp)
}

/// [`Coro`] returned by [`gather`].
pub struct Gather<T> {
    tasks: Vec<Task<T>>,
    timeout: Option<Duration>,
    started_at: Option<Instant>,
}

impl<T> fmt::Debug for Gather<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gather")
            .field("tasks", &self.tasks.len())
            .field("timeout", &self.timeout)
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl<T> Coro for Gather<T> {
    type Output = Vec<T>;

    fn advance(&mut self, cancel: bool) -> Poll<Result<Vec<T>, Error>> {
        if cancel {
            for task in &self.tasks {
                task.cancel();
            }
            return Poll::Ready(Err(Error::Cancelled));
        }

        if self.tasks.iter().all(Task::done) {
            let results = self
                .tasks
                .iter()
                .map(|t| {
                    t.take_result()
                        .expect("every gathered task is done, so a finished one has a result")
                })
                .collect();
            return Poll::Ready(Ok(results));
        }

        if let Some(timeout) = self.timeout {
            let started_at = *self.started_at.get_or_insert_with(Instant::now);
            if started_at.elapsed() > timeout {
                let pending: Vec<Id> = self
                    .tasks
                    .iter()
                    .filter(|t| !t.done())
                    .map(Task::id)
                    .collect();
                return Poll::Ready(Err(Error::Timeout { pending }));
            }
        }

        Poll::Pending
    }
}

/// Admit every input as a task on the running loop, and resolve once all have finished,
/// preserving the input order in the result vector regardless of completion order.
///
/// # Errors
///
/// Returns [`Error::Timeout`] naming the still-pending task ids if `timeout` is set and
/// exceeded before every task finishes.
pub fn gather<T: 'static>(
    coros_or_tasks: impl IntoIterator<Item = impl IntoTask<T>>,
    timeout: Option<Duration>,
) -> Gather<T> {
    let lp = loop_for_run();
    let tasks = coros_or_tasks
        .into_iter()
        .map(|c| c.into_task(&lp))
        .collect();
    Gather {
        tasks,
        timeout,
        started_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::from_fn;
    use crate::time::sleep;

    #[test]
    fn gather_preserves_argument_order_regardless_of_completion_order() {
        let lp = Loop::new();
        let _guard = current::enter(&lp);

        let mut fast = sleep(Duration::from_millis(1));
        let mut slow = sleep(Duration::from_millis(20));
        let coros: Vec<Box<dyn Coro<Output = u32>>> = vec![
            Box::new(from_fn(move |c| match slow.advance(c) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(())) => Poll::Ready(Ok(1)),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            })),
            Box::new(from_fn(move |c| match fast.advance(c) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(())) => Poll::Ready(Ok(2)),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            })),
        ];

        let mut g = gather(coros, None);
        let result = loop {
            match g.advance(false) {
                Poll::Pending => {
                    lp.tick().unwrap();
                }
                Poll::Ready(result) => break result.unwrap(),
            }
        };

        assert_eq!(result, vec![1, 2]);
    }

    #[test]
    fn gather_times_out_naming_pending_tasks() {
        let lp = Loop::new();
        let _guard = current::enter(&lp);

        let never = from_fn(|_| Poll::<Result<(), Error>>::Pending);
        let mut g = gather(vec![never], Some(Duration::from_millis(1)));

        let result = loop {
            lp.tick().unwrap();
            if let Poll::Ready(result) = g.advance(false) {
                break result;
            }
        };

        assert!(matches!(result, Err(Error::Timeout { .. })));
    }
}
