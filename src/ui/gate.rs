//! The UI gate: a timeout-capable mutex that owns the retained widget tree.
//!
//! Every UI mutation goes through [`UiGate::lock`]; the tree is only
//! reachable through the returned guard, so "no UI call without the gate" is
//! enforced by the type system rather than a runtime assertion. Built over
//! `Mutex` + `Condvar` since the std mutex has no timed acquisition.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct UiGate<T> {
    held: Mutex<bool>,
    cv: Condvar,
    value: UnsafeCell<T>,
}

// The value is only ever reachable through a guard, and a guard exists only
// while `held` is true for exactly one owner.
unsafe impl<T: Send> Send for UiGate<T> {}
unsafe impl<T: Send> Sync for UiGate<T> {}

impl<T> UiGate<T> {
    pub fn new(value: T) -> Self {
        Self {
            held: Mutex::new(false),
            cv: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire the gate. `timeout_ms <= 0` blocks indefinitely; otherwise the
    /// call gives up after the deadline and returns `None`.
    pub fn lock(&self, timeout_ms: i32) -> Option<UiGuard<'_, T>> {
        let mut held = self.flag();

        if timeout_ms <= 0 {
            while *held {
                held = self.cv.wait(held).unwrap_or_else(|e| e.into_inner());
            }
        } else {
            let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
            while *held {
                let now = Instant::now();
                if now >= deadline {
                    log::warn!("UI gate lock timeout after {} ms", timeout_ms);
                    return None;
                }
                let (guard, _) = self
                    .cv
                    .wait_timeout(held, deadline - now)
                    .unwrap_or_else(|e| e.into_inner());
                held = guard;
            }
        }

        *held = true;
        Some(UiGuard { gate: self })
    }

    /// Acquire with no deadline. Used by the UI worker itself.
    pub fn lock_blocking(&self) -> UiGuard<'_, T> {
        // lock(0) blocks until acquired and cannot return None.
        self.lock(0).expect("blocking lock cannot time out")
    }
}

pub struct UiGuard<'a, T> {
    gate: &'a UiGate<T>,
}

impl<T> Deref for UiGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.gate.value.get() }
    }
}

impl<T> DerefMut for UiGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.gate.value.get() }
    }
}

impl<T> Drop for UiGuard<'_, T> {
    fn drop(&mut self) {
        let mut held = self.gate.flag();
        *held = false;
        self.gate.cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_times_out_while_held() {
        let gate = Arc::new(UiGate::new(0u32));
        let g2 = Arc::clone(&gate);

        let guard = gate.lock(100).unwrap();
        let handle = thread::spawn(move || g2.lock(50).is_none());
        assert!(handle.join().unwrap());
        drop(guard);

        assert!(gate.lock(50).is_some());
    }

    #[test]
    fn guard_serializes_mutation() {
        let gate = Arc::new(UiGate::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let mut v = gate.lock_blocking();
                    *v += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*gate.lock_blocking(), 400);
    }
}
