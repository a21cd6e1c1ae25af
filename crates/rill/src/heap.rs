//! Reorder heap for the ordered scheduling style.
//!
//! Results computed out of turn wait here, keyed by sequence number, until
//! the consumer-facing order catches up. The heap and the current sequence
//! counter live in one [`CasCell`] so that "is the top entry next in line?"
//! is always answered against a consistent pair.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use crate::sync::CasCell;
use crate::task::Task;

/// A parked result for one sequence number.
pub(crate) enum HeapEntry<T> {
    /// The task produced exactly this value.
    Value(T),
    /// A partially evaluated remainder of the task.
    Stream(Task<T>),
    /// The task produced nothing; the slot only exists so the sequence can
    /// advance past it.
    Null,
}

struct SeqEntry<T> {
    seq: u64,
    entry: HeapEntry<T>,
}

// BinaryHeap is a max-heap; invert the comparison to pop the smallest
// sequence number first.
impl<T> Ord for SeqEntry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.seq.cmp(&self.seq)
    }
}

impl<T> PartialOrd for SeqEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for SeqEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for SeqEntry<T> {}

struct HeapState<T> {
    heap: BinaryHeap<SeqEntry<T>>,
    current_seq: u64,
}

pub(crate) struct ReorderHeap<T> {
    state: CasCell<HeapState<T>>,
}

impl<T: Send + 'static> ReorderHeap<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: CasCell::new(HeapState {
                heap: BinaryHeap::new(),
                current_seq: 0,
            }),
        }
    }

    /// Park an entry. Returns `true` when the entry lands at the front of
    /// the line (its sequence number is the current one), which means a
    /// token is now claimable and sleepers should be woken.
    pub(crate) fn insert(&self, seq: u64, entry: HeapEntry<T>) -> bool {
        self.state.modify(move |s| {
            debug_assert!(seq >= s.current_seq, "entry {seq} is already in the past");
            s.heap.push(SeqEntry { seq, entry });
            seq == s.current_seq
        })
    }

    /// Take the entry whose sequence number is the current one, if parked.
    pub(crate) fn pop_if_current(&self) -> Option<(u64, HeapEntry<T>)> {
        self.state.modify(|s| {
            if s.heap.peek().map(|e| e.seq) == Some(s.current_seq) {
                s.heap.pop().map(|e| (e.seq, e.entry))
            } else {
                None
            }
        })
    }

    /// Move on to the next sequence number. Returns `true` when the heap
    /// already holds that entry (a new token is claimable).
    pub(crate) fn advance(&self) -> bool {
        self.state.modify(|s| {
            s.current_seq += 1;
            s.heap.peek().map(|e| e.seq) == Some(s.current_seq)
        })
    }

    pub(crate) fn current_seq(&self) -> u64 {
        self.state.modify(|s| s.current_seq)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.modify(|s| s.heap.is_empty())
    }

    pub(crate) fn len(&self) -> usize {
        self.state.modify(|s| s.heap.len())
    }
}
