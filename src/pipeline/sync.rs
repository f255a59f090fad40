//! Mutex + condition variable pair used by every inter-stage queue
//!
//! A [`Monitor`] owns both the protected value and the condition variable,
//! so the condvar can only ever be used with the one lock it belongs to.
//! Waiting requires a [`MonitorGuard`], which makes "wait without holding
//! the lock" unrepresentable.
//!
//! Wakeups may be spurious: callers re-check their predicate in a loop
//! around [`MonitorGuard::wait`].

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A value guarded by a mutex, with a condition variable bound to that mutex
#[derive(Debug, Default)]
pub struct Monitor<T> {
    value: Mutex<T>,
    cond: Condvar,
}

impl<T> Monitor<T> {
    /// Create a new monitor around `value`
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    /// Acquire the lock exclusively
    ///
    /// A poisoned lock is recovered: a stage that panicked while holding it
    /// must not prevent the remaining stages from shutting down.
    pub fn lock(&self) -> MonitorGuard<'_, T> {
        MonitorGuard {
            monitor: self,
            guard: self.value.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Wake one thread blocked in [`MonitorGuard::wait`]
    pub fn signal(&self) {
        self.cond.notify_one();
    }

    /// Wake every thread blocked in [`MonitorGuard::wait`]
    pub fn signal_all(&self) {
        self.cond.notify_all();
    }

    /// Consume the monitor and return the protected value
    pub fn into_inner(self) -> T {
        self.value.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof that the monitor's lock is held
///
/// Dropping the guard (or calling [`MonitorGuard::unlock`]) releases the lock.
pub struct MonitorGuard<'a, T> {
    monitor: &'a Monitor<T>,
    guard: MutexGuard<'a, T>,
}

impl<'a, T> MonitorGuard<'a, T> {
    /// Atomically release the lock and block until signalled, then re-acquire it
    pub fn wait(self) -> Self {
        let MonitorGuard { monitor, guard } = self;
        let guard = monitor
            .cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner);
        MonitorGuard { monitor, guard }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    ///
    /// The returned flag is `true` when the wait timed out.
    pub fn wait_timeout(self, timeout: Duration) -> (Self, bool) {
        let MonitorGuard { monitor, guard } = self;
        let (guard, result) = monitor
            .cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (MonitorGuard { monitor, guard }, result.timed_out())
    }

    /// Wake one waiter while still holding the lock
    pub fn signal(&self) {
        self.monitor.signal();
    }

    /// Wake all waiters while still holding the lock
    pub fn signal_all(&self) {
        self.monitor.signal_all();
    }

    /// Release the lock
    pub fn unlock(self) {}
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
