//! Output queue and the producer→consumer doorbell.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_utils::{Backoff, CachePadded};

use crate::task::ChildEvent;

// ---------------------------------------------------------------------------
// Output queue
// ---------------------------------------------------------------------------

struct OutNode<T> {
    ev: Option<ChildEvent<T>>,
    /// Immutable after publication; only the draining consumer follows it.
    next: *mut OutNode<T>,
}

/// Outcome of one push, as seen by the producer.
#[derive(Debug, Clone, Copy)]
pub struct PushOutcome {
    /// The queue was empty immediately before this push. The producer that
    /// observes the empty→non-empty edge owns the doorbell handshake.
    pub was_empty: bool,
    /// Queue length including this push. The length counters are
    /// maintained next to the list rather than inside it, so concurrent
    /// pushes can observe them lagging by at most the number of in-flight
    /// producers.
    pub len: usize,
    /// Queued `Yield` events including this push (when it is one). Stop
    /// events are bookkeeping and never throttled, so buffer decisions
    /// look at this count, not `len`.
    pub values: usize,
}

/// Multi-producer/single-consumer event list.
///
/// Producers prepend with a CAS; the consumer drains everything with a
/// single swap and reverses to restore arrival order. Producers never
/// traverse the list, so drained nodes can be freed immediately.
pub struct OutputQueue<T> {
    head: CachePadded<AtomicPtr<OutNode<T>>>,
    len: CachePadded<AtomicUsize>,
    /// Queued `Yield` events only; drives the bounded-buffer check.
    values: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for OutputQueue<T> {}
unsafe impl<T: Send> Sync for OutputQueue<T> {}

impl<T> OutputQueue<T> {
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            len: CachePadded::new(AtomicUsize::new(0)),
            values: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, ev: ChildEvent<T>) -> PushOutcome {
        let is_value = matches!(ev, ChildEvent::Yield(_));
        let node = Box::into_raw(Box::new(OutNode { ev: Some(ev), next: ptr::null_mut() }));
        let backoff = Backoff::new();
        loop {
            let old = self.head.load(Ordering::Relaxed);
            unsafe { (*node).next = old };
            if self
                .head
                .compare_exchange(old, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                let len = self.len.fetch_add(1, Ordering::Relaxed) + 1;
                let values = if is_value {
                    self.values.fetch_add(1, Ordering::Relaxed) + 1
                } else {
                    self.values.load(Ordering::Relaxed)
                };
                return PushOutcome {
                    was_empty: old.is_null(),
                    len,
                    values,
                };
            }
            backoff.spin();
        }
    }

    /// Take every queued event, oldest first. Consumer-only.
    pub fn drain(&self) -> Vec<ChildEvent<T>> {
        let mut p = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        if p.is_null() {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut values = 0;
        while !p.is_null() {
            let mut node = unsafe { Box::from_raw(p) };
            if let Some(ev) = node.ev.take() {
                if matches!(ev, ChildEvent::Yield(_)) {
                    values += 1;
                }
                out.push(ev);
            }
            p = node.next;
        }
        self.len.fetch_sub(out.len(), Ordering::Relaxed);
        self.values.fetch_sub(values, Ordering::Relaxed);
        out.reverse();
        out
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for OutputQueue<T> {
    fn drop(&mut self) {
        let mut p = *self.head.get_mut();
        while !p.is_null() {
            let node = unsafe { Box::from_raw(p) };
            p = node.next;
        }
    }
}

// ---------------------------------------------------------------------------
// Doorbell
// ---------------------------------------------------------------------------

/// One-slot wakeup signal from producers to the single consumer.
///
/// The signal is edge-triggered and binary: any number of rings while the
/// consumer is away collapse into one pending wakeup. Lost wakeups are
/// prevented by the `need` handshake:
///
/// - consumer: `arm()`, store-load barrier, re-check the queue, `wait()`
/// - producer: push, store-load barrier, `take_need()`, and ring only if it
///   came back `true`
///
/// Clearing `need` *before* ringing matters: if the producer rang first,
/// the consumer could wake, re-arm, and then have the stale clear wipe the
/// fresh arm, losing every wakeup after that.
///
/// All cross-flag decisions are sequentially consistent operations, so the
/// "producer misses the sleeper AND consumer misses the event" interleaving
/// cannot happen.
pub struct Doorbell {
    signaled: CachePadded<AtomicBool>,
    need: CachePadded<AtomicBool>,
    sleepers: CachePadded<AtomicUsize>,
    m: Mutex<()>,
    cv: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self {
            signaled: CachePadded::new(AtomicBool::new(false)),
            need: CachePadded::new(AtomicBool::new(false)),
            sleepers: CachePadded::new(AtomicUsize::new(0)),
            m: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Producer side: post the wakeup.
    pub fn ring(&self) {
        self.signaled.swap(true, Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            // Taking the mutex orders this notify after the sleeper's final
            // signaled check, so the notify cannot slip into the gap
            // between that check and the wait.
            let _g = self.m.lock().expect("doorbell mutex poisoned");
            self.cv.notify_one();
        }
    }

    /// Consumer side: block until rung. Consumes the pending signal.
    pub fn wait(&self) {
        if self.signaled.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut g = self.m.lock().expect("doorbell mutex poisoned");
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        loop {
            if self.signaled.swap(false, Ordering::SeqCst) {
                self.sleepers.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            g = self.cv.wait(g).expect("doorbell condvar poisoned");
        }
    }

    /// Like [`wait`](Self::wait) with an upper bound. Returns `true` if the
    /// doorbell rang, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.signaled.swap(false, Ordering::AcqRel) {
            return true;
        }
        let start = Instant::now();
        let mut g = self.m.lock().expect("doorbell mutex poisoned");
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        loop {
            if self.signaled.swap(false, Ordering::SeqCst) {
                self.sleepers.fetch_sub(1, Ordering::Relaxed);
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                self.sleepers.fetch_sub(1, Ordering::Relaxed);
                return false;
            }
            let (gg, res) = self
                .cv
                .wait_timeout(g, timeout - elapsed)
                .expect("doorbell condvar poisoned");
            g = gg;
            if res.timed_out() {
                self.sleepers.fetch_sub(1, Ordering::Relaxed);
                return self.signaled.swap(false, Ordering::SeqCst);
            }
        }
    }

    /// Consumer side: announce that the next event must ring.
    pub fn arm(&self) {
        self.need.store(true, Ordering::SeqCst);
    }

    /// Consumer side: withdraw the announcement after finding work without
    /// a ring.
    pub fn disarm(&self) {
        self.need.store(false, Ordering::Relaxed);
    }

    /// Producer side: check-and-clear the consumer's request. At most one
    /// producer wins per arm.
    pub fn take_need(&self) -> bool {
        self.need.load(Ordering::SeqCst) && self.need.swap(false, Ordering::SeqCst)
    }
}

impl Default for Doorbell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_restores_arrival_order() {
        let q: OutputQueue<u32> = OutputQueue::new();
        for v in [1, 2, 3] {
            q.push(ChildEvent::Yield(v));
        }
        let drained: Vec<u32> = q
            .drain()
            .into_iter()
            .map(|ev| match ev {
                ChildEvent::Yield(v) => v,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(drained, vec![1, 2, 3]);
        assert_eq!(q.len(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn push_reports_empty_transition_once() {
        let q: OutputQueue<u32> = OutputQueue::new();
        assert!(q.push(ChildEvent::Yield(1)).was_empty);
        assert!(!q.push(ChildEvent::Yield(2)).was_empty);
        q.drain();
        assert!(q.push(ChildEvent::Yield(3)).was_empty);
    }

    #[test]
    fn len_tracks_pushes() {
        let q: OutputQueue<u32> = OutputQueue::new();
        assert_eq!(q.push(ChildEvent::Yield(1)).len, 1);
        assert_eq!(q.push(ChildEvent::Yield(2)).len, 2);
        assert_eq!(q.len(), 2);
        q.drain();
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn stop_events_do_not_count_as_values() {
        let q: OutputQueue<u32> = OutputQueue::new();
        assert_eq!(q.push(ChildEvent::Yield(1)).values, 1);
        let outcome = q.push(ChildEvent::Stop(0, None));
        assert_eq!(outcome.len, 2, "stops still occupy the event list");
        assert_eq!(outcome.values, 1, "stops must not consume buffer room");
        assert_eq!(q.push(ChildEvent::Yield(2)).values, 2);
        q.drain();
        assert_eq!(q.push(ChildEvent::Yield(3)).values, 1, "drain resets the value count");
    }
}
