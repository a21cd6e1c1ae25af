//! Cheap always-on diagnostic counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub(crate) struct SvarStats {
    total_dispatches: AtomicU64,
    max_workers: AtomicUsize,
    max_heap_size: AtomicUsize,
    max_backlog: AtomicUsize,
}

impl SvarStats {
    pub(crate) fn note_dispatch(&self) {
        self.total_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_workers(&self, n: usize) {
        self.max_workers.fetch_max(n, Ordering::Relaxed);
    }

    pub(crate) fn note_heap(&self, n: usize) {
        self.max_heap_size.fetch_max(n, Ordering::Relaxed);
    }

    pub(crate) fn note_backlog(&self, n: usize) {
        self.max_backlog.fetch_max(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_dispatches: self.total_dispatches.load(Ordering::Relaxed),
            max_workers: self.max_workers.load(Ordering::Relaxed),
            max_heap_size: self.max_heap_size.load(Ordering::Relaxed),
            max_backlog: self.max_backlog.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a scheduler's diagnostic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Workers forked over the scheduler's lifetime.
    pub total_dispatches: u64,
    /// High-water mark of concurrently running workers.
    pub max_workers: usize,
    /// High-water mark of parked reorder-heap entries.
    pub max_heap_size: usize,
    /// High-water mark of queued output values (stop events excluded).
    pub max_backlog: usize,
}
