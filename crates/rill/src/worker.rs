//! Worker threads: forking, the per-style work loops, and the exit
//! protocol.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::conduit::{Conduit, Style};
use crate::error::SchedError;
use crate::heap::{HeapEntry, ReorderHeap};
use crate::task::{Step, Task, WorkerId};

/// Thread-local bookkeeping for one worker.
pub(crate) struct WorkerInfo {
    /// Maximum yields before self-termination; `None` = unlimited.
    yield_budget: Option<u64>,
    yields_total: u64,
    window_count: u64,
    window_start: Instant,
    /// Yields between latency reports.
    period: u64,
}

impl WorkerInfo {
    fn new<T: Send + 'static>(conduit: &Conduit<T>, budget: Option<u64>) -> Self {
        let period = conduit
            .rate
            .as_ref()
            .map_or(u64::MAX, |rc| rc.period(conduit.max_buffer));
        Self {
            yield_budget: budget,
            yields_total: 0,
            window_count: 0,
            window_start: Instant::now(),
            period,
        }
    }

    /// Budgets bound a worker's output exactly; checked on every yield.
    fn over_budget(&self) -> bool {
        self.yield_budget.map_or(false, |b| self.yields_total >= b)
    }

    /// Account one yield. Returns `true` when a latency window was flushed,
    /// which is the cadence for surplus checks.
    fn on_yield<T: Send + 'static>(&mut self, conduit: &Conduit<T>) -> bool {
        self.yields_total += 1;
        self.window_count += 1;
        if self.window_count >= self.period {
            self.flush(conduit);
            true
        } else {
            false
        }
    }

    fn flush<T: Send + 'static>(&mut self, conduit: &Conduit<T>) {
        if let Some(rc) = &conduit.rate {
            if self.window_count > 0 {
                rc.record(self.window_count, self.window_start.elapsed().as_nanos() as u64);
            }
            self.period = rc.period(conduit.max_buffer);
        }
        self.window_count = 0;
        self.window_start = Instant::now();
    }
}

/// What a freshly forked worker runs.
enum Role<T> {
    /// Pull tasks from the conduit's work queue until it drains.
    Pool,
    /// Evaluate exactly this task (parallel style).
    Producer(Task<T>),
}

/// Fork a pool worker. Returns `false` if the thread could not be spawned.
pub(crate) fn fork<T: Send + 'static>(conduit: &Conduit<T>, budget: Option<u64>) -> bool {
    fork_role(conduit, Role::Pool, budget)
}

/// Fork an eager producer for one task (parallel style).
pub(crate) fn fork_producer<T: Send + 'static>(conduit: &Conduit<T>, task: Task<T>) {
    fork_role(conduit, Role::Producer(task), None);
}

fn fork_role<T: Send + 'static>(conduit: &Conduit<T>, role: Role<T>, budget: Option<u64>) -> bool {
    // Callers reach us through a live Arc, so the upgrade only fails while
    // the conduit is already being torn down.
    let Some(shared) = conduit.me.upgrade() else {
        return false;
    };
    // Count first so the dispatcher sees the slot taken; the set
    // registration happens after spawn (transient overshoot by one is
    // expected between the two).
    let prev = conduit.worker_count.fetch_add(1, Ordering::AcqRel);
    conduit.stats.note_dispatch();
    conduit.stats.note_workers(prev + 1);

    let id = conduit.next_worker.fetch_add(1, Ordering::Relaxed);
    let spawned = thread::Builder::new()
        .name(format!("rill-worker-{id}"))
        .spawn(move || worker_main(shared, id, role, budget));

    match spawned {
        Ok(_) => {
            conduit.toggle_registration(id);
            true
        }
        Err(e) => {
            warn!(error = %e, "failed to spawn worker thread");
            conduit.worker_count.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }
}

fn worker_main<T: Send + 'static>(
    conduit: Arc<Conduit<T>>,
    id: WorkerId,
    role: Role<T>,
    budget: Option<u64>,
) {
    trace!(id, "worker started");
    let mut info = WorkerInfo::new(&conduit, budget);

    let outcome = catch_unwind(AssertUnwindSafe(|| match role {
        Role::Producer(task) => run_producer(&conduit, &mut info, task),
        Role::Pool => match conduit.style {
            Style::Ahead => run_ordered(&conduit, &mut info),
            _ => run_unordered(&conduit, &mut info),
        },
    }));
    let err = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(payload) => Some(SchedError::WorkerPanic(panic_message(payload))),
    };

    // Exit protocol: flush the latency window, step out of the count
    // (recording the idle edge), unregister, then post the stop.
    info.flush(&conduit);
    let prev = conduit.worker_count.fetch_sub(1, Ordering::AcqRel);
    if prev == 1 {
        if let Some(rc) = &conduit.rate {
            rc.note_all_stopped();
        }
    }
    conduit.toggle_registration(id);
    if err.is_some() {
        debug!(id, "worker stopping with error");
    } else {
        trace!(id, yields = info.yields_total, "worker stopped");
    }
    conduit.send_stop(id, err);
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Self-termination check: budget exhausted or the pool is oversubscribed
/// relative to the configured cap / the paced target.
fn should_stop<T: Send + 'static>(conduit: &Conduit<T>, info: &WorkerInfo) -> bool {
    if let Some(budget) = info.yield_budget {
        if info.yields_total >= budget {
            return true;
        }
    }
    let count = conduit.worker_count.load(Ordering::Acquire);
    if count > conduit.cfg.max_workers {
        return true;
    }
    if let Some(rc) = &conduit.rate {
        if rc.measured_ns() > 0 && count > rc.desired() {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Unordered styles (LIFO / FIFO)
// ---------------------------------------------------------------------------

fn run_unordered<T: Send + 'static>(
    conduit: &Conduit<T>,
    info: &mut WorkerInfo,
) -> Result<(), SchedError> {
    loop {
        if conduit.is_cancelled() || should_stop(conduit, info) {
            return Ok(());
        }
        let Some(task) = conduit.work.pop_task() else {
            return Ok(());
        };
        if !run_task(conduit, info, task)? {
            return Ok(());
        }
    }
}

/// Evaluate one task to completion. Returns `false` when the worker must
/// exit; any unfinished remainder has already been re-queued.
fn run_task<T: Send + 'static>(
    conduit: &Conduit<T>,
    info: &mut WorkerInfo,
    mut task: Task<T>,
) -> Result<bool, SchedError> {
    loop {
        match task.step()? {
            Step::Done => return Ok(true),
            Step::Yield(value, tail) => {
                let more = conduit.send(value);
                let flushed = info.on_yield(conduit);
                match (more, tail) {
                    (true, Some(t)) => {
                        if info.over_budget() || (flushed && should_stop(conduit, info)) {
                            conduit.work.push_task(t);
                            return Ok(false);
                        }
                        task = t;
                    }
                    (true, None) => return Ok(true),
                    (false, Some(t)) => {
                        // Buffer full or credit gone: park the remainder
                        // for a future worker and bow out.
                        conduit.work.push_task(t);
                        return Ok(false);
                    }
                    (false, None) => return Ok(false),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel style
// ---------------------------------------------------------------------------

fn run_producer<T: Send + 'static>(
    conduit: &Conduit<T>,
    info: &mut WorkerInfo,
    mut task: Task<T>,
) -> Result<(), SchedError> {
    loop {
        match task.step()? {
            Step::Done => return Ok(()),
            Step::Yield(value, tail) => {
                let more = conduit.send(value);
                info.on_yield(conduit);
                match (more, tail) {
                    (true, Some(t)) => task = t,
                    // No work queue to park on; a refused send ends the
                    // producer. Only cancellation or yield-credit
                    // exhaustion can refuse here, the parallel buffer
                    // itself is unbounded.
                    _ => return Ok(()),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ordered style
// ---------------------------------------------------------------------------

fn run_ordered<T: Send + 'static>(
    conduit: &Conduit<T>,
    info: &mut WorkerInfo,
) -> Result<(), SchedError> {
    let Some(heap) = conduit.heap.as_ref() else {
        return Ok(());
    };
    loop {
        if conduit.is_cancelled() || should_stop(conduit, info) {
            return Ok(());
        }
        // A parked entry at the current sequence number outranks new work:
        // claiming it is what keeps delivery in source order and prevents
        // a livelock where everyone computes ahead and nobody delivers.
        if let Some((seq, entry)) = heap.pop_if_current() {
            if !run_with_token(conduit, info, heap, seq, entry)? {
                return Ok(());
            }
            continue;
        }
        let Some((task, seq)) = conduit.work.pop_seq() else {
            return Ok(());
        };
        if seq == heap.current_seq() {
            if !run_with_token(conduit, info, heap, seq, HeapEntry::Stream(task))? {
                return Ok(());
            }
        } else {
            compute_ahead(conduit, heap, seq, task)?;
        }
    }
}

/// Holder of the delivery token: push straight to the output queue and
/// advance the sequence when this entry's task finishes. Returns `false`
/// when the worker must exit (remainder parked at its own sequence).
fn run_with_token<T: Send + 'static>(
    conduit: &Conduit<T>,
    info: &mut WorkerInfo,
    heap: &ReorderHeap<T>,
    seq: u64,
    entry: HeapEntry<T>,
) -> Result<bool, SchedError> {
    let mut task = match entry {
        HeapEntry::Null => {
            expose(conduit, heap.advance());
            return Ok(true);
        }
        HeapEntry::Value(v) => {
            let more = conduit.send(v);
            info.on_yield(conduit);
            expose(conduit, heap.advance());
            return Ok(more);
        }
        HeapEntry::Stream(task) => task,
    };
    loop {
        match task.step()? {
            Step::Done => {
                expose(conduit, heap.advance());
                return Ok(true);
            }
            Step::Yield(value, tail) => {
                let more = conduit.send(value);
                let flushed = info.on_yield(conduit);
                match (more, tail) {
                    (true, Some(t)) => {
                        if info.over_budget() || (flushed && should_stop(conduit, info)) {
                            park(conduit, heap, seq, HeapEntry::Stream(t));
                            return Ok(false);
                        }
                        task = t;
                    }
                    (true, None) => {
                        expose(conduit, heap.advance());
                        return Ok(true);
                    }
                    (false, Some(t)) => {
                        // Abandon the token: the remainder goes back under
                        // this sequence, un-advanced, so whoever resumes it
                        // delivers before anything newer.
                        park(conduit, heap, seq, HeapEntry::Stream(t));
                        return Ok(false);
                    }
                    (false, None) => {
                        expose(conduit, heap.advance());
                        return Ok(false);
                    }
                }
            }
        }
    }
}

/// Without the token: evaluate a single step and park the result. One entry
/// per sequence number keeps the heap bounded by the task count.
fn compute_ahead<T: Send + 'static>(
    conduit: &Conduit<T>,
    heap: &ReorderHeap<T>,
    seq: u64,
    task: Task<T>,
) -> Result<(), SchedError> {
    let entry = match task.step()? {
        Step::Done => HeapEntry::Null,
        Step::Yield(v, None) => HeapEntry::Value(v),
        Step::Yield(v, Some(tail)) => HeapEntry::Stream(Task::cons(v, Some(tail))),
    };
    park(conduit, heap, seq, entry);
    Ok(())
}

fn park<T: Send + 'static>(
    conduit: &Conduit<T>,
    heap: &ReorderHeap<T>,
    seq: u64,
    entry: HeapEntry<T>,
) {
    let exposed = heap.insert(seq, entry);
    conduit.stats.note_heap(heap.len());
    expose(conduit, exposed);
}

/// A newly claimable current-sequence entry must wake the consumer so it
/// can dispatch a worker to claim it, even when no output arrived.
fn expose<T: Send + 'static>(conduit: &Conduit<T>, exposed: bool) {
    if exposed {
        conduit.doorbell.ring();
    }
}
