//! One-way cancellation for the threads a connection handler runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A trip-once flag shared by every task of one handler.
///
/// Tripping it never blocks; sleepers are woken so loops observe the flag
/// promptly instead of at their next natural wakeup.
#[derive(Default)]
pub(crate) struct Cancel {
    tripped: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Cancel {
    pub fn cancel(&self) {
        self.tripped.store(true, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Sleep for `period` or until cancelled. Returns true when cancelled.
    pub fn sleep(&self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        let mut guard = self.lock.lock();
        loop {
            if self.is_cancelled() {
                return true;
            }
            if self.wake.wait_until(&mut guard, deadline).timed_out() {
                return self.is_cancelled();
            }
        }
    }
}
