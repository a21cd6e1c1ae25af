//! Low-level synchronization primitives shared by the scheduler internals.

use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, Ordering};

use crossbeam_utils::Backoff;

/// Number of fast spin retries before a contended CAS loop starts yielding
/// the CPU. Keeps the common low-contention case cheap while bounding the
/// worst-case busy-wait.
pub const CAS_FAST_RETRIES: u32 = 25;

/// Write barrier: everything stored before the fence is visible to any
/// thread that observes a store issued after it.
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Store-load barrier: prevents the CPU from hoisting a later load above an
/// earlier store. Used between "I just enqueued" and "did the consumer ask
/// for a doorbell?", which is the classic lost-wakeup window.
#[inline]
pub fn store_load_barrier() {
    fence(Ordering::SeqCst);
}

/// A mutation cell driven by a CAS loop instead of a mutex.
///
/// The state lives behind an `AtomicPtr`. `modify` steals the pointer
/// (swapping in null), mutates the state exclusively, and publishes it
/// back. Contending threads spin up to [`CAS_FAST_RETRIES`] times and then
/// fall back to a yielding backoff.
///
/// This is the primitive behind every compound shared structure in the
/// scheduler (reorder heap state, worker set, ordered work slot); scalar
/// state uses plain atomics instead.
pub struct CasCell<T> {
    slot: AtomicPtr<T>,
}

impl<T> CasCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: AtomicPtr::new(Box::into_raw(Box::new(value))),
        }
    }

    /// Run `f` with exclusive access to the state.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let p = self.acquire();
        // Exclusive: every other thread observes null until we publish.
        let r = f(unsafe { &mut *p });
        self.slot.store(p, Ordering::Release);
        r
    }

    fn acquire(&self) -> *mut T {
        let backoff = Backoff::new();
        let mut spins = 0u32;
        loop {
            let p = self.slot.swap(ptr::null_mut(), Ordering::Acquire);
            if !p.is_null() {
                return p;
            }
            if spins < CAS_FAST_RETRIES {
                spins += 1;
                backoff.spin();
            } else {
                backoff.snooze();
            }
        }
    }
}

impl<T> Drop for CasCell<T> {
    fn drop(&mut self) {
        let p = *self.slot.get_mut();
        if !p.is_null() {
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

unsafe impl<T: Send> Send for CasCell<T> {}
unsafe impl<T: Send> Sync for CasCell<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn modify_returns_closure_result() {
        let cell = CasCell::new(41);
        let out = cell.modify(|v| {
            *v += 1;
            *v
        });
        assert_eq!(out, 42);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let cell = Arc::new(CasCell::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cell = Arc::clone(&cell);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    cell.modify(|v| *v += 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.modify(|v| *v), 8000);
    }
}
