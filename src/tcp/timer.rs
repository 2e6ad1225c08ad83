//! The resettable TIME-WAIT timer.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct TimerState {
    deadline: Instant,
    cancelled: bool,
}

/// A one-shot timer on its own thread. Re-arming pushes the deadline out;
/// cancelling makes it fire never. The callback runs on the timer thread.
pub(crate) struct StopTimer {
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl StopTimer {
    pub fn arm<F>(duration: Duration, on_fire: F) -> Arc<StopTimer>
    where
        F: FnOnce() + Send + 'static,
    {
        let timer = Arc::new(StopTimer {
            state: Mutex::new(TimerState {
                deadline: Instant::now() + duration,
                cancelled: false,
            }),
            changed: Condvar::new(),
        });
        let runner = Arc::clone(&timer);
        thread::spawn(move || {
            let mut state = runner.state.lock();
            loop {
                if state.cancelled {
                    return;
                }
                if Instant::now() >= state.deadline {
                    break;
                }
                let deadline = state.deadline;
                runner.changed.wait_until(&mut state, deadline);
            }
            drop(state);
            on_fire();
        });
        timer
    }

    /// Push the deadline out by `duration` from now.
    pub fn reset(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.deadline = Instant::now() + duration;
        self.changed.notify_all();
    }

    /// Stop the timer without firing.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.changed.notify_all();
    }
}
