//! One-shot close signal.
//!
//! A binary latch released by the endpoint's close callback and awaited by
//! the driver. Releasing twice is a no-op; waiting blocks on a condition
//! variable rather than polling.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

/// Single-producer, single-consumer readiness latch
#[derive(Debug, Default)]
pub struct CloseSignal {
    released: Mutex<bool>,
    cond: Condvar,
}

impl CloseSignal {
    /// Create a signal in the blocking state
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the signal, waking any waiter.
    ///
    /// Returns `true` if this call performed the release.
    pub fn release(&self) -> bool {
        let mut released = self.lock();
        if *released {
            trace!("Close signal already released");
            return false;
        }
        *released = true;
        self.cond.notify_all();
        true
    }

    /// Return the signal to its blocking state
    pub fn reset(&self) {
        *self.lock() = false;
    }

    pub fn is_released(&self) -> bool {
        *self.lock()
    }

    /// Block until released or `timeout` elapses.
    ///
    /// Returns whether the signal was released in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut released = self.lock();
        while !*released {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(released, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            released = guard;
        }
        true
    }
}
