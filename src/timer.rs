// timer.rs

use parking_lot::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

/// Absolute expiry of a caller-supplied timeout.
///
/// A blocking call may wake up many times before its predicate holds; each
/// wait takes the time left rather than the full timeout. `None` means
/// wait forever.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    expiry: Option<Instant>,
}

impl Deadline {
    /// Start the clock for `timeout`.
    ///
    /// A timeout too large to represent as an `Instant` counts as infinite.
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        let expiry = timeout.and_then(|t| Instant::now().checked_add(t));
        Self { expiry }
    }
}

/// Wait on `cvar` until notified or until `deadline` passes.
///
/// # Returns
/// `true` if the deadline has passed. The caller re-checks its predicate
/// either way, since wakeups may be spurious.
pub(crate) fn wait_deadline<T>(
    cvar: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: &Deadline,
) -> bool {
    match deadline.expiry {
        None => {
            cvar.wait(guard);
            false
        }
        Some(expiry) => cvar.wait_until(guard, expiry).timed_out(),
    }
}
