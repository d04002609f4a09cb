use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Mutex paired with a condition variable. Every locker notifies all waiters
/// when it is released, so a waiter re-checks its predicate after any change
/// to the protected state.
pub struct Monitor<T> {
    mutex: Mutex<T>,
    cv: Condvar,
}

impl<T> Monitor<T> {
    pub const fn new(val: T) -> Self {
        Self {
            mutex: Mutex::new(val),
            cv: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MonitorLocker<'_, T> {
        MonitorLocker {
            guard: self.mutex.lock(),
            cv: &self.cv,
        }
    }

    pub fn notify_all(&self) -> usize {
        self.cv.notify_all()
    }
}

pub struct MonitorLocker<'a, T> {
    cv: &'a Condvar,
    guard: MutexGuard<'a, T>,
}

impl<'a, T> MonitorLocker<'a, T> {
    pub fn wait(&mut self) {
        self.cv.wait(&mut self.guard);
    }

    /// Returns true if the wait timed out.
    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        self.cv.wait_for(&mut self.guard, timeout).timed_out()
    }

    pub fn wait_while(&mut self, condition: impl FnMut(&mut T) -> bool) {
        self.cv.wait_while(&mut self.guard, condition)
    }

    /// Returns true if the wait timed out with `condition` still holding.
    pub fn wait_while_for(
        &mut self,
        condition: impl FnMut(&mut T) -> bool,
        timeout: Duration,
    ) -> bool {
        self.cv
            .wait_while_for(&mut self.guard, condition, timeout)
            .timed_out()
    }
}

impl<'a, T> Deref for MonitorLocker<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> DerefMut for MonitorLocker<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<'a, T> Drop for MonitorLocker<'a, T> {
    fn drop(&mut self) {
        self.cv.notify_all();
    }
}
