//! The scheduler handle: work queue, worker pool, output queue, doorbell.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::config::Config;
use crate::dispatch;
use crate::error::SchedResult;
use crate::heap::ReorderHeap;
use crate::output::{Doorbell, OutputQueue};
use crate::queue::{AheadSlot, FifoQueue, LifoStack, WorkQueue};
use crate::rate::RateControl;
use crate::stats::{StatsSnapshot, SvarStats};
use crate::sync::{store_load_barrier, write_barrier};
use crate::task::{ChildEvent, Task, WorkerId};
use crate::worker;

/// Work distribution style.
///
/// The style fixes the work-queue discipline and the ordering contract of
/// the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    /// Depth-first: newest work first, no cross-task ordering.
    Lifo,
    /// Breadth-first: oldest work first, no cross-task ordering.
    Fifo,
    /// Source order: output matches enqueue order exactly.
    Ahead,
    /// One eagerly forked producer per task, unbounded buffer.
    Parallel,
}

/// A bounded, rate-adaptive multi-producer/single-consumer conduit.
///
/// One consumer drains [`read_output`](Conduit::read_output); N workers
/// evaluate queued tasks and push the results back. Workers are forked on
/// demand by the consumer-driven dispatcher, throttled either by buffer
/// occupancy (bounded mode) or by a target yield rate (paced mode).
pub struct Conduit<T> {
    /// Self-handle so worker forks can clone an owning reference from a
    /// shared borrow.
    pub(crate) me: Weak<Conduit<T>>,
    pub(crate) style: Style,
    pub(crate) cfg: Config,
    pub(crate) output: OutputQueue<T>,
    pub(crate) doorbell: Doorbell,
    /// `-1` = unbounded (always the case for [`Style::Parallel`]).
    pub(crate) max_buffer: i64,
    /// Remaining yield credit; `-1` = unlimited. Monotonically decreasing.
    yield_remaining: AtomicI64,
    pub(crate) work: WorkQueue<T>,
    pub(crate) heap: Option<ReorderHeap<T>>,
    pub(crate) rate: Option<RateControl>,
    workers: crate::sync::CasCell<HashSet<WorkerId>>,
    pub(crate) worker_count: AtomicUsize,
    pub(crate) next_worker: AtomicU64,
    pub(crate) cancelled: AtomicBool,
    pub(crate) stats: SvarStats,
}

impl<T: Send + 'static> Conduit<T> {
    /// Build a conduit of the given style.
    pub fn new(style: Style, cfg: Config) -> SchedResult<Arc<Self>> {
        cfg.validate()?;
        if cfg.max_workers == 0 {
            // The zero-worker synchronous mode lives in the driver; a
            // conduit without workers could never make progress.
            return Err(crate::error::SchedError::invalid_config(
                "a conduit needs max_workers >= 1; use the driver for synchronous runs",
            ));
        }
        let (work, heap, max_buffer) = match style {
            Style::Lifo => (WorkQueue::Lifo(LifoStack::new()), None, cfg.max_buffer),
            Style::Fifo => (WorkQueue::Fifo(FifoQueue::new()), None, cfg.max_buffer),
            Style::Ahead => (
                WorkQueue::Ahead(AheadSlot::new()),
                Some(ReorderHeap::new()),
                cfg.max_buffer,
            ),
            // Parallel producers are never backpressured.
            Style::Parallel => (WorkQueue::Absent, None, -1),
        };
        let rate = cfg
            .target_latency_ns()
            .map(|target| RateControl::new(target, cfg.worker_latency, cfg.max_workers));
        let yield_remaining = AtomicI64::new(cfg.yield_limit.map_or(-1, |l| l as i64));
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            style,
            cfg,
            output: OutputQueue::new(),
            doorbell: Doorbell::new(),
            max_buffer,
            yield_remaining,
            work,
            heap,
            rate,
            workers: crate::sync::CasCell::new(HashSet::new()),
            worker_count: AtomicUsize::new(0),
            next_worker: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            stats: SvarStats::default(),
        }))
    }

    /// Ordered conduit with an initial task queued and one worker already
    /// dispatched.
    pub fn new_ahead(cfg: Config, first: Task<T>) -> SchedResult<Arc<Self>> {
        let conduit = Self::new(Style::Ahead, cfg)?;
        conduit.enqueue(first);
        worker::fork(&conduit, None);
        Ok(conduit)
    }

    /// Unbounded conduit that forks one producer per enqueued task.
    pub fn new_parallel(cfg: Config) -> SchedResult<Arc<Self>> {
        Self::new(Style::Parallel, cfg)
    }

    pub fn style(&self) -> Style {
        self.style
    }

    /// Queue a task. Non-blocking; for [`Style::Parallel`] the producer is
    /// forked immediately instead.
    pub fn enqueue(&self, task: Task<T>) {
        match self.style {
            Style::Parallel => self.push_worker_par(task),
            _ => {
                self.work.push_task(task);
                // Publish the item, then check whether the consumer asked to
                // be woken. Clearing the request before ringing keeps a
                // later re-arm from being wiped by this producer.
                write_barrier();
                store_load_barrier();
                if self.doorbell.take_need() {
                    self.doorbell.ring();
                }
            }
        }
    }

    /// Fork an eager producer for `task` (parallel style).
    pub fn push_worker_par(&self, task: Task<T>) {
        worker::fork_producer(self, task);
    }

    /// Drain queued events, blocking (on the doorbell only) until progress
    /// is possible. An empty result means end of stream.
    pub fn read_output(&self) -> Vec<ChildEvent<T>> {
        dispatch::read_output(self)
    }

    /// `true` once the stream is finished: no queued work, no parked
    /// results, no live workers, no unread events. Stays `true`.
    pub fn post_process(&self) -> bool {
        self.is_work_done()
            && self.worker_count.load(Ordering::Acquire) == 0
            && self.workers.modify(|s| s.is_empty())
            && self.output.is_empty()
    }

    /// Cooperatively cancel every worker. Workers observe the flag at their
    /// next yield or dequeue and exit with a `Stop` event.
    pub fn cancel_all(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!(
                style = ?self.style,
                workers = self.worker_ids().len(),
                "cancelling all workers"
            );
        }
        self.doorbell.ring();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // -- internal ----------------------------------------------------------

    /// No further values can be produced from the queues: cancelled, yield
    /// credit exhausted, or both work queue and heap drained.
    pub(crate) fn is_work_done(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        if self.yield_remaining.load(Ordering::Acquire) == 0 {
            return true;
        }
        self.work.is_empty() && self.heap.as_ref().map_or(true, |h| h.is_empty())
    }

    /// Remaining yield credit, if a limit is set.
    pub(crate) fn yield_credit(&self) -> Option<u64> {
        match self.yield_remaining.load(Ordering::Acquire) {
            v if v < 0 => None,
            v => Some(v as u64),
        }
    }

    fn take_yield_credit(&self) -> bool {
        if self.yield_remaining.load(Ordering::Acquire) < 0 {
            return true;
        }
        self.yield_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Worker side: deliver one value. Returns `false` when the worker must
    /// stop producing (buffer full, yield credit exhausted, or cancelled).
    pub(crate) fn send(&self, value: T) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            return false;
        }
        if !self.take_yield_credit() {
            return false;
        }
        let outcome = self.output.push(ChildEvent::Yield(value));
        self.stats.note_backlog(outcome.values);
        write_barrier();
        if outcome.was_empty {
            store_load_barrier();
            if self.doorbell.take_need() {
                self.doorbell.ring();
            }
        }
        // Throttle on queued values only; stop events are bookkeeping.
        self.max_buffer < 0 || (outcome.values as i64) < self.max_buffer
    }

    /// Worker side: post a termination event. Always rings: the consumer
    /// must learn about stops even when it never armed the doorbell.
    pub(crate) fn send_stop(&self, id: WorkerId, err: Option<crate::error::SchedError>) {
        self.output.push(ChildEvent::Stop(id, err));
        write_barrier();
        self.doorbell.ring();
    }

    /// Insert-or-remove `id` in the worker set. Both the forking parent and
    /// the exiting worker call this, so whichever runs second performs the
    /// remove and a completed worker can never stay registered. A remove
    /// also rings the doorbell in case the consumer sleeps through the
    /// shutdown.
    pub(crate) fn toggle_registration(&self, id: WorkerId) {
        let removed = self.workers.modify(|s| {
            if !s.insert(id) {
                s.remove(&id);
                true
            } else {
                false
            }
        });
        if removed {
            self.doorbell.ring();
        }
    }

    /// Snapshot of registered worker ids.
    pub(crate) fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.modify(|s| s.iter().copied().collect())
    }
}

impl<T> std::fmt::Debug for Conduit<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conduit")
            .field("style", &self.style)
            .field("max_buffer", &self.max_buffer)
            .field("workers", &self.worker_count.load(Ordering::Relaxed))
            .field("backlog", &self.output.len())
            .finish()
    }
}
