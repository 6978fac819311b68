//! Non-blocking synchronization helpers.

use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// A value guarded by an atomic try-lock.
///
/// There is no waiting queue: callers either get the value immediately or
/// decide themselves how to retry.
pub(crate) struct Exclusive<T> {
    busy: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized through `busy`.
unsafe impl<T: Send> Sync for Exclusive<T> {}

impl<T> Exclusive<T> {
    pub fn new(value: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn try_lock(&self) -> Option<ExclusiveGuard<'_, T>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ExclusiveGuard { owner: self })
    }

    /// Retries `try_lock` with a capped backoff until it succeeds.
    pub fn lock_spinning(&self) -> ExclusiveGuard<'_, T> {
        let mut backoff = SleepBackoff::new(1, 1000);
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            backoff.wait(u64::MAX);
        }
    }
}

pub(crate) struct ExclusiveGuard<'a, T> {
    owner: &'a Exclusive<T>,
}

impl<T> ExclusiveGuard<'_, T> {
    /// Raw access for code that must not hold a `&mut T` across a context switch.
    pub fn as_ptr(&self) -> *mut T {
        self.owner.value.get()
    }
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.busy.store(false, Ordering::Release);
    }
}

/// Spin briefly, then sleep with a capped exponential step.
pub(crate) struct SleepBackoff {
    spin: Backoff,
    sleep_us: u64,
    max_us: u64,
}

impl SleepBackoff {
    pub fn new(initial_us: u64, max_us: u64) -> Self {
        let max_us = max_us.max(1);
        Self {
            spin: Backoff::new(),
            sleep_us: initial_us.clamp(1, max_us),
            max_us,
        }
    }

    /// Waits one step, never sleeping longer than `limit_us`.
    pub fn wait(&mut self, limit_us: u64) {
        if !self.spin.is_completed() {
            self.spin.snooze();
            return;
        }
        thread::sleep(Duration::from_micros(self.sleep_us.min(limit_us).max(1)));
        self.sleep_us = (self.sleep_us * 2).min(self.max_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_try_lock_is_exclusive() {
        let cell = Exclusive::new(5);
        let mut guard = cell.try_lock().unwrap();
        assert!(cell.try_lock().is_none());
        *guard += 1;
        drop(guard);
        assert_eq!(*cell.try_lock().unwrap(), 6);
    }

    #[test]
    fn test_lock_spinning_across_threads() {
        let cell = Arc::new(Exclusive::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *cell.lock_spinning() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*cell.try_lock().unwrap(), 4000);
    }
}
