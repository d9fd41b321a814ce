//! Completion fence: a monotonically increasing counter signaled by the
//! device when a batch finishes.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct FenceState {
    completed: Mutex<u64>,
    cond: Condvar,
}

/// Cloneable fence handle. Clones observe the same counter.
#[derive(Debug, Clone, Default)]
pub struct Fence {
    inner: Arc<FenceState>,
}

impl Fence {
    /// Fence at value 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value the device reached.
    pub fn completed_value(&self) -> u64 {
        *self
            .inner
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance the counter to `value`. Lower values are ignored.
    pub fn signal(&self, value: u64) {
        let mut completed = self
            .inner
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if value > *completed {
            *completed = value;
            self.inner.cond.notify_all();
        }
    }

    /// Block until the counter reaches `value`.
    pub fn wait(&self, value: u64) {
        let mut completed = self
            .inner
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *completed < value {
            completed = self
                .inner
                .cond
                .wait(completed)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the counter reaches `value` or `timeout` elapses.
    /// Returns whether the value was reached.
    pub fn wait_timeout(&self, value: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completed = self
            .inner
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *completed < value {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            completed = self
                .inner
                .cond
                .wait_timeout(completed, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn signals_never_go_backwards() {
        let fence = Fence::new();
        fence.signal(4);
        fence.signal(2);
        assert_eq!(fence.completed_value(), 4);
    }

    #[test]
    fn wait_returns_after_signal_from_another_thread() {
        let fence = Fence::new();
        let remote = fence.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.signal(1);
        });
        fence.wait(1);
        assert_eq!(fence.completed_value(), 1);
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_reports_unreached_values() {
        let fence = Fence::new();
        fence.signal(1);
        assert!(fence.wait_timeout(1, Duration::from_millis(1)));
        assert!(!fence.wait_timeout(2, Duration::from_millis(5)));
    }
}
