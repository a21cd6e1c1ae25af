//! Work-queue disciplines, one per scheduling style.
//!
//! The linked queues never free a node while the queue is alive: popped
//! nodes are retired to a free list and reclaimed on drop. No address is
//! ever reused, so a stale pointer read by a racing push/pop lands in
//! still-allocated memory and the subsequent CAS fails harmlessly. That
//! removes both ABA and use-after-free without an epoch collector, at a
//! memory cost bounded by the number of tasks enqueued over the queue's
//! lifetime (node shells only; the payload moves out on pop).

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::sync::CasCell;
use crate::task::Task;

// ---------------------------------------------------------------------------
// LIFO
// ---------------------------------------------------------------------------

struct LifoNode<T> {
    item: UnsafeCell<Option<T>>,
    next: AtomicPtr<LifoNode<T>>,
}

/// Treiber stack. Push prepends, pop takes the head, giving depth-first
/// traversal of nested compositions.
pub struct LifoStack<T> {
    head: CachePadded<AtomicPtr<LifoNode<T>>>,
    retired: AtomicPtr<LifoNode<T>>,
}

unsafe impl<T: Send> Send for LifoStack<T> {}
unsafe impl<T: Send> Sync for LifoStack<T> {}

impl<T> LifoStack<T> {
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            retired: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&self, item: T) {
        let node = Box::into_raw(Box::new(LifoNode {
            item: UnsafeCell::new(Some(item)),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let backoff = Backoff::new();
        loop {
            let old = self.head.load(Ordering::Acquire);
            unsafe { (*node).next.store(old, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange(old, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let old = self.head.load(Ordering::Acquire);
            if old.is_null() {
                return None;
            }
            let next = unsafe { (*old).next.load(Ordering::Acquire) };
            if self
                .head
                .compare_exchange(old, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Only the winning popper touches the payload.
                let item = unsafe { (*(*old).item.get()).take() };
                self.retire(old);
                return item;
            }
            backoff.spin();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    fn retire(&self, node: *mut LifoNode<T>) {
        // Unreachable from `head`; its `next` can be repurposed as the
        // free-list link.
        loop {
            let r = self.retired.load(Ordering::Relaxed);
            unsafe { (*node).next.store(r, Ordering::Relaxed) };
            if self
                .retired
                .compare_exchange(r, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl<T> Drop for LifoStack<T> {
    fn drop(&mut self) {
        for start in [*self.head.get_mut(), *self.retired.get_mut()] {
            let mut p = start;
            while !p.is_null() {
                let mut node = unsafe { Box::from_raw(p) };
                p = *node.next.get_mut();
                drop(node.item.get_mut().take());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FIFO (Michael–Scott)
// ---------------------------------------------------------------------------

struct FifoNode<T> {
    item: UnsafeCell<Option<T>>,
    next: AtomicPtr<FifoNode<T>>,
    /// Free-list link. `next` must stay intact after retirement because a
    /// lagging enqueuer may still read it to help swing the tail.
    free_next: AtomicPtr<FifoNode<T>>,
}

impl<T> FifoNode<T> {
    fn alloc(item: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            item: UnsafeCell::new(item),
            next: AtomicPtr::new(ptr::null_mut()),
            free_next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Michael–Scott queue. Push appends at the tail, pop takes from the head,
/// giving breadth-first traversal.
pub struct FifoQueue<T> {
    head: CachePadded<AtomicPtr<FifoNode<T>>>,
    tail: CachePadded<AtomicPtr<FifoNode<T>>>,
    retired: AtomicPtr<FifoNode<T>>,
}

unsafe impl<T: Send> Send for FifoQueue<T> {}
unsafe impl<T: Send> Sync for FifoQueue<T> {}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        let dummy = FifoNode::alloc(None);
        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            retired: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&self, item: T) {
        let node = FifoNode::alloc(Some(item));
        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                if unsafe { &(*tail).next }
                    .compare_exchange(ptr::null_mut(), node, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    // Best-effort tail swing; a failure means someone helped.
                    let _ = self.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return;
                }
            } else {
                // Tail is lagging; help it along.
                let _ =
                    self.tail
                        .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            }
            backoff.spin();
        }
    }

    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                return None;
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // `next` is the new dummy; its payload belongs to us now.
                let item = unsafe { (*(*next).item.get()).take() };
                self.retire(head);
                return item;
            }
            backoff.spin();
        }
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        unsafe { (*head).next.load(Ordering::Acquire) }.is_null()
    }

    fn retire(&self, node: *mut FifoNode<T>) {
        loop {
            let r = self.retired.load(Ordering::Relaxed);
            unsafe { (*node).free_next.store(r, Ordering::Relaxed) };
            if self
                .retired
                .compare_exchange(r, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl<T> Drop for FifoQueue<T> {
    fn drop(&mut self) {
        // Live chain (includes the current dummy).
        let mut p = *self.head.get_mut();
        while !p.is_null() {
            let mut node = unsafe { Box::from_raw(p) };
            p = *node.next.get_mut();
            drop(node.item.get_mut().take());
        }
        // Retired dummies.
        let mut p = *self.retired.get_mut();
        while !p.is_null() {
            let mut node = unsafe { Box::from_raw(p) };
            p = *node.free_next.get_mut();
            drop(node.item.get_mut().take());
        }
    }
}

// ---------------------------------------------------------------------------
// Ordered slot
// ---------------------------------------------------------------------------

struct SlotState<T> {
    entries: VecDeque<(Task<T>, u64)>,
    next_seq: u64,
}

/// Sequence-numbered work queue for ordered scheduling.
///
/// Every task entering at the tail receives the next sequence number, and
/// workers drain from the front, so dequeues see sequence numbers in
/// order. Tasks never re-enter the slot: a worker suspending mid-task
/// parks the remainder in the reorder heap under its original number.
pub struct AheadSlot<T> {
    state: CasCell<SlotState<T>>,
}

impl<T: Send + 'static> AheadSlot<T> {
    pub fn new() -> Self {
        Self {
            state: CasCell::new(SlotState {
                entries: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    /// Append a new task; returns the sequence number it was assigned.
    pub fn push_back(&self, task: Task<T>) -> u64 {
        self.state.modify(move |s| {
            let seq = s.next_seq;
            s.next_seq += 1;
            s.entries.push_back((task, seq));
            seq
        })
    }

    pub fn pop(&self) -> Option<(Task<T>, u64)> {
        self.state.modify(|s| s.entries.pop_front())
    }

    pub fn is_empty(&self) -> bool {
        self.state.modify(|s| s.entries.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Per-style selection
// ---------------------------------------------------------------------------

/// The work queue of one scheduler, selected by style.
pub(crate) enum WorkQueue<T> {
    Lifo(LifoStack<Task<T>>),
    Fifo(FifoQueue<Task<T>>),
    Ahead(AheadSlot<T>),
    /// Parallel style forks producers eagerly and queues nothing.
    Absent,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Queue a whole task (unordered styles only).
    pub(crate) fn push_task(&self, task: Task<T>) {
        match self {
            WorkQueue::Lifo(q) => q.push(task),
            WorkQueue::Fifo(q) => q.push(task),
            WorkQueue::Ahead(q) => {
                q.push_back(task);
            }
            WorkQueue::Absent => {
                debug_assert!(false, "parallel style has no work queue");
            }
        }
    }

    pub(crate) fn pop_task(&self) -> Option<Task<T>> {
        match self {
            WorkQueue::Lifo(q) => q.pop(),
            WorkQueue::Fifo(q) => q.pop(),
            WorkQueue::Ahead(_) | WorkQueue::Absent => None,
        }
    }

    pub(crate) fn pop_seq(&self) -> Option<(Task<T>, u64)> {
        match self {
            WorkQueue::Ahead(q) => q.pop(),
            _ => None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            WorkQueue::Lifo(q) => q.is_empty(),
            WorkQueue::Fifo(q) => q.is_empty(),
            WorkQueue::Ahead(q) => q.is_empty(),
            WorkQueue::Absent => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lifo_orders_last_in_first_out() {
        let q = LifoStack::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_orders_first_in_first_out() {
        let q = FifoQueue::new();
        assert!(q.is_empty());
        q.push(1);
        q.push(2);
        q.push(3);
        assert!(!q.is_empty());
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn fifo_concurrent_push_pop_loses_nothing() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 2000;
        let q = Arc::new(FifoQueue::new());
        let popped = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.push(p * PER_PRODUCER + i);
                }
            }));
        }
        for _ in 0..4 {
            let q = Arc::clone(&q);
            let popped = Arc::clone(&popped);
            handles.push(thread::spawn(move || loop {
                match q.pop() {
                    Some(v) => {
                        popped.fetch_add(v, std::sync::atomic::Ordering::Relaxed);
                    }
                    None => {
                        if popped.load(std::sync::atomic::Ordering::Relaxed)
                            == (0..PRODUCERS * PER_PRODUCER).sum::<u64>()
                        {
                            return;
                        }
                        thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            popped.load(std::sync::atomic::Ordering::Relaxed),
            (0..PRODUCERS * PER_PRODUCER).sum::<u64>(),
            "every pushed value must be popped exactly once"
        );
    }

    #[test]
    fn lifo_concurrent_stress() {
        let q = Arc::new(LifoStack::new());
        let popped = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..2000u64 {
                    q.push(i);
                }
            }));
        }
        for _ in 0..4 {
            let q = Arc::clone(&q);
            let popped = Arc::clone(&popped);
            handles.push(thread::spawn(move || {
                let mut count = 0u64;
                while count < 2000 {
                    if q.pop().is_some() {
                        count += 1;
                    } else {
                        thread::yield_now();
                    }
                }
                popped.fetch_add(count, std::sync::atomic::Ordering::Relaxed);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(popped.load(std::sync::atomic::Ordering::Relaxed), 8000);
        assert!(q.is_empty());
    }

    #[test]
    fn slot_assigns_dense_sequence_numbers() {
        let slot: AheadSlot<u32> = AheadSlot::new();
        assert_eq!(slot.push_back(Task::from_iter(0..1)), 0);
        assert_eq!(slot.push_back(Task::from_iter(0..1)), 1);
        let (_, s0) = slot.pop().expect("first entry");
        let (_, s1) = slot.pop().expect("second entry");
        assert_eq!((s0, s1), (0, 1));
        assert!(slot.pop().is_none());
    }
}
