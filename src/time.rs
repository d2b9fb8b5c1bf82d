// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative delay by polling the wall clock.
//!
//! There is no timer wheel or deadline heap here -- a [`Sleep`] just compares `Instant::now()`
//! against its deadline on every `advance` and emits a pause until it's past. Precision is
//! bounded by how often the owning [`Loop`](crate::scheduler::Loop) ticks, not by this type.

use crate::coro::Coro;
use crate::error::Error;
use std::task::Poll;
use std::time::{Duration, Instant};

/// Pause until `delay` has elapsed, then complete with `()`.
#[must_use]
pub fn sleep(delay: Duration) -> Sleep {
    Sleep {
        delay,
        deadline: None,
    }
}

/// [`Coro`] returned by [`sleep`].
#[derive(Debug)]
pub struct Sleep {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Coro for Sleep {
    type Output = ();

    fn advance(&mut self, cancel: bool) -> Poll<Result<(), Error>> {
        if cancel {
            return Poll::Ready(Err(Error::Cancelled));
        }
        let deadline = *self
            .deadline
            .get_or_insert_with(|| Instant::now() + self.delay);
        if Instant::now() >= deadline {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pauses_until_the_deadline_then_completes() {
        let mut s = sleep(Duration::from_millis(5));
        assert!(s.advance(false).is_pending());
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(s.advance(false), Poll::Ready(Ok(()))));
    }

    #[test]
    fn cancellation_is_immediate() {
        let mut s = sleep(Duration::from_secs(60));
        assert!(matches!(s.advance(true), Poll::Ready(Err(Error::Cancelled))));
    }
}
