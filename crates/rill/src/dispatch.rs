//! Consumer-driven dispatch: bounded and paced blocking reads.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::conduit::{Conduit, Style};
use crate::rate::{PaceDecision, RateControl};
use crate::sync::store_load_barrier;
use crate::task::ChildEvent;
use crate::worker;

/// Read queued events, blocking until progress is possible. Empty result
/// means end of stream.
pub(crate) fn read_output<T: Send + 'static>(conduit: &Conduit<T>) -> Vec<ChildEvent<T>> {
    let batch = conduit.output.drain();
    if !batch.is_empty() {
        conduit.doorbell.disarm();
        return batch;
    }
    loop {
        let keep_going = match &conduit.rate {
            Some(rc) => paced_cycle(conduit, rc),
            None => bounded_cycle(conduit),
        };
        if !keep_going {
            return Vec::new();
        }
        let batch = conduit.output.drain();
        if !batch.is_empty() {
            conduit.doorbell.disarm();
            return batch;
        }
    }
}

/// One bounded-mode wait cycle. Returns `false` at end of stream.
///
/// Order matters: arm the doorbell, barrier, dispatch once more, then
/// re-check before sleeping. Events that arrived between the arm and the
/// wait are caught by the re-check; events after it ring the doorbell.
fn bounded_cycle<T: Send + 'static>(conduit: &Conduit<T>) -> bool {
    dispatch_bounded(conduit);
    if conduit.output.len() == 0 {
        thread::sleep(pre_arm_wait(conduit.style));
    }
    if conduit.output.len() > 0 {
        return true;
    }
    conduit.doorbell.arm();
    store_load_barrier();
    dispatch_bounded(conduit);
    if conduit.output.len() > 0 {
        return true;
    }
    if conduit.post_process() {
        conduit.doorbell.disarm();
        return false;
    }
    wait_for_events(conduit);
    true
}

/// Fork one worker if work is pending and the caps allow another.
fn dispatch_bounded<T: Send + 'static>(conduit: &Conduit<T>) {
    if conduit.is_work_done() {
        return;
    }
    let mut limit = conduit.cfg.max_workers;
    if let Some(credit) = conduit.yield_credit() {
        // No point running more workers than there are yields left.
        limit = limit.min(credit as usize);
    }
    if conduit.worker_count.load(Ordering::Acquire) < limit {
        worker::fork(conduit, None);
    }
}

/// One paced-mode wait cycle. Returns `false` at end of stream.
fn paced_cycle<T: Send + 'static>(conduit: &Conduit<T>, rc: &RateControl) -> bool {
    // The consumer is driving again: close any idle window now, so that
    // pacing sleeps issued below count toward the long-term duration while
    // true consumer absence does not.
    rc.note_dispatch_from_idle();
    rc.collect(conduit.max_buffer);

    let mut dispatched = false;
    if !conduit.is_work_done() {
        match rc.estimate(conduit.cfg.max_workers) {
            PaceDecision::Bootstrap => {
                // No measurement yet: keep the seed floor running and wait
                // for the first worker to report.
                while conduit.worker_count.load(Ordering::Acquire) < conduit.cfg.min_workers {
                    if !worker::fork(conduit, Some(rc.dispatch_budget())) {
                        break;
                    }
                    dispatched = true;
                }
            }
            PaceDecision::Dispatch(target) => {
                trace!(target, "paced dispatch");
                while conduit.worker_count.load(Ordering::Acquire) < target {
                    if !worker::fork(conduit, Some(rc.dispatch_budget())) {
                        break;
                    }
                    dispatched = true;
                }
            }
            PaceDecision::Pace { sleep_ns, budget } => {
                if sleep_ns > 0 {
                    trace!(sleep_ns, "pacing sleep");
                    thread::sleep(Duration::from_nanos(sleep_ns));
                    // Time passed; re-evaluate before any doorbell wait.
                    dispatched = true;
                }
                if conduit.worker_count.load(Ordering::Acquire) == 0 {
                    dispatched |= worker::fork(conduit, Some(budget));
                }
                // With live workers and nothing to sleep off, fall through
                // to the doorbell rather than spin.
            }
        }
    }
    if dispatched {
        return true;
    }

    conduit.doorbell.arm();
    store_load_barrier();
    if conduit.output.len() > 0 {
        return true;
    }
    if conduit.post_process() {
        conduit.doorbell.disarm();
        return false;
    }
    wait_for_events(conduit);
    true
}

/// Block on the doorbell. While a cancellation is draining, wait with a
/// timeout instead so the reap loop re-checks the worker set even if a
/// stop ring was consumed early.
fn wait_for_events<T: Send + 'static>(conduit: &Conduit<T>) {
    if conduit.is_cancelled() {
        let _ = conduit.doorbell.wait_timeout(Duration::from_millis(10));
    } else {
        conduit.doorbell.wait();
    }
}

/// Short wait before arming the doorbell: forking plus a context switch
/// usually lands the first event within tens of microseconds, so spending
/// them here avoids a full park/unpark round trip on busy streams.
fn pre_arm_wait(style: Style) -> Duration {
    let micros = if num_cpus::get() <= 1 {
        100
    } else {
        match style {
            Style::Ahead => 100,
            Style::Lifo | Style::Fifo => 25,
            Style::Parallel => 10,
        }
    };
    Duration::from_micros(micros)
}
