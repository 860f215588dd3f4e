//! Blocking waits with timeout and interruption
//!
//! Every suspension point of the host API funnels through [`wait_until`]:
//! a condition variable wait that re-checks its predicate on each wakeup
//! and reports why it stopped as a [`WaitOutcome`].

use std::time::{Duration, Instant};

use parking_lot::{Condvar, MutexGuard};

/// Why a wait stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition holds
    Ready,
    /// The deadline passed first
    TimedOut,
    /// The waiter was interrupted; protocol state is untouched
    Interrupted,
}

/// Block on `cond` until `check` yields an outcome or `timeout` elapses
///
/// `check` runs with the lock held, first before any sleep and then after
/// every wakeup, including the one at the deadline. `None` as timeout
/// waits forever.
pub(crate) fn wait_until<T, F>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    timeout: Option<Duration>,
    mut check: F,
) -> WaitOutcome
where
    F: FnMut(&mut T) -> Option<WaitOutcome>,
{
    // An unrepresentable deadline is as good as none
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

    loop {
        if let Some(outcome) = check(&mut **guard) {
            return outcome;
        }

        match deadline {
            None => cond.wait(guard),
            Some(deadline) => {
                if cond.wait_until(guard, deadline).timed_out() {
                    return check(&mut **guard).unwrap_or(WaitOutcome::TimedOut);
                }
            }
        }
    }
}
