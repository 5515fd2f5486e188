//! Small synchronization helpers shared by the runtime.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// Lock a mutex, recovering the data if a holder panicked.
#[inline]
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Countdown latch: threads call `count_down` as they exit; shutdown waits
/// for zero with a deadline.
pub(crate) struct Latch {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Latch {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn count_down(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    /// Remaining count.
    pub(crate) fn count(&self) -> usize {
        *lock(&self.count)
    }

    /// Wait until the count reaches zero or `deadline` passes.
    /// Returns true if the count reached zero.
    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let mut count = lock(&self.count);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = match self.cv.wait_timeout(count, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }
}
