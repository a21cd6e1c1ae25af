//! Latency accounting and the pacing model for rate-driven dispatch.
//!
//! Workers report `(yields, busy time)` windows into the `current` block.
//! The consumer folds those into `collected` until the sample has enough
//! mass, then records a smoothed per-yield latency. The latency estimate
//! and the long-term yield count drive the desired worker count.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::config::MIN_DELAY_NS;

/// What the paced dispatcher should do this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PaceDecision {
    /// No latency measurement exists yet; keep the seed workers running and
    /// wait for the first report.
    Bootstrap,
    /// Bring the worker count up to the given target.
    Dispatch(usize),
    /// Production is ahead of the target rate: optionally sleep off the
    /// surplus, then run a single worker with a bounded yield budget.
    Pace { sleep_ns: u64, budget: u64 },
}

pub(crate) struct RateControl {
    /// Target latency per yield (ns); the inverse of the configured rate.
    target_ns: u64,
    /// Current window, written by workers.
    cur_count: CachePadded<AtomicU64>,
    cur_time_ns: CachePadded<AtomicU64>,
    /// Accumulated windows that lacked the mass for a measurement.
    col_count: AtomicU64,
    col_time_ns: AtomicU64,
    /// Smoothed per-yield worker latency (ns); 0 until first measurement.
    measured_ns: AtomicU64,
    /// Total yields since the stream started.
    long_count: AtomicU64,
    started: Instant,
    /// Wall-clock spent with zero workers, excluded from the long-term
    /// duration so idle streams do not look infinitely slow.
    idle_ns: AtomicU64,
    idle_since_ns: AtomicU64,
    /// Worker-count target published for surplus shedding.
    desired: AtomicUsize,
}

const NOT_IDLE: u64 = u64::MAX;

impl RateControl {
    pub(crate) fn new(target_ns: u64, latency_hint: Option<Duration>, max_workers: usize) -> Self {
        let seed = latency_hint.map_or(0, |d| d.as_nanos() as u64);
        Self {
            target_ns,
            cur_count: CachePadded::new(AtomicU64::new(0)),
            cur_time_ns: CachePadded::new(AtomicU64::new(0)),
            col_count: AtomicU64::new(0),
            col_time_ns: AtomicU64::new(0),
            measured_ns: AtomicU64::new(seed),
            long_count: AtomicU64::new(0),
            started: Instant::now(),
            idle_ns: AtomicU64::new(0),
            idle_since_ns: AtomicU64::new(NOT_IDLE),
            desired: AtomicUsize::new(max_workers),
        }
    }

    // -- worker side --------------------------------------------------------

    /// Fold one latency window into the current block.
    pub(crate) fn record(&self, yields: u64, busy_ns: u64) {
        if yields == 0 {
            return;
        }
        self.cur_count.fetch_add(yields, Ordering::Relaxed);
        self.cur_time_ns.fetch_add(busy_ns, Ordering::Relaxed);
        self.long_count.fetch_add(yields, Ordering::Relaxed);
    }

    /// How many yields a worker should run between latency reports.
    pub(crate) fn period(&self, max_buffer: i64) -> u64 {
        let l = match self.measured_ns.load(Ordering::Relaxed) {
            0 => self.target_ns,
            l => l,
        };
        let cap = if max_buffer > 0 { max_buffer as u64 } else { u64::MAX };
        (MIN_DELAY_NS / l.max(1)).min(cap).max(1)
    }

    /// Called by the last worker on its way out.
    pub(crate) fn note_all_stopped(&self) {
        self.idle_since_ns
            .store(self.started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    // -- consumer side ------------------------------------------------------

    /// Called whenever the consumer starts a dispatch cycle. Closes an open
    /// idle window so consumer absence is excluded from the long-term
    /// duration while deliberate pacing sleeps still count.
    pub(crate) fn note_dispatch_from_idle(&self) {
        let since = self.idle_since_ns.swap(NOT_IDLE, Ordering::Relaxed);
        if since != NOT_IDLE {
            let now = self.started.elapsed().as_nanos() as u64;
            self.idle_ns.fetch_add(now.saturating_sub(since), Ordering::Relaxed);
        }
    }

    /// Fold the current window into the collected block and re-measure if
    /// the pending sample has enough mass, the latency moved by more than
    /// 2x, or no measurement exists yet.
    pub(crate) fn collect(&self, max_buffer: i64) {
        let n = self.cur_count.swap(0, Ordering::Relaxed);
        let t = self.cur_time_ns.swap(0, Ordering::Relaxed);
        let pending_n = self.col_count.load(Ordering::Relaxed) + n;
        let pending_t = self.col_time_ns.load(Ordering::Relaxed) + t;
        if pending_n == 0 {
            return;
        }

        let old = self.measured_ns.load(Ordering::Relaxed);
        let fresh = pending_t / pending_n;
        let buffer_mass = max_buffer > 0 && pending_n > max_buffer as u64;
        let time_mass = pending_t > MIN_DELAY_NS;
        let moved = old > 0 && (fresh > old.saturating_mul(2) || fresh < old / 2);

        if old == 0 || buffer_mass || time_mass || moved {
            self.measured_ns.store(fresh.max(1), Ordering::Relaxed);
            self.col_count.store(0, Ordering::Relaxed);
            self.col_time_ns.store(0, Ordering::Relaxed);
        } else {
            self.col_count.store(pending_n, Ordering::Relaxed);
            self.col_time_ns.store(pending_t, Ordering::Relaxed);
        }
    }

    /// Derive the dispatch decision from the measured latency, the target
    /// latency, and the long-term yield count.
    ///
    /// With latency `L`, target `E`, long-term count `C` over duration `D`:
    /// the per-rate baseline is `L/E` workers, the deficit term is
    /// `D/E - C` yields behind schedule, damped by a gain of
    /// `max(1, 1000/L)`. A non-positive net means production runs ahead of
    /// the target and the consumer should pace instead of dispatch.
    pub(crate) fn estimate(&self, max_workers: usize) -> PaceDecision {
        let l = self.measured_ns.load(Ordering::Relaxed);
        if l == 0 {
            return PaceDecision::Bootstrap;
        }
        let e = self.target_ns.max(1);
        let count = self.long_count.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_nanos() as u64;
        let duration = elapsed.saturating_sub(self.idle_ns.load(Ordering::Relaxed));

        let n_base = l as f64 / e as f64;
        let extra = duration as f64 / e as f64 - count as f64;
        let gain = (1000.0 / l as f64).max(1.0);
        let net = (n_base + extra / gain).round() as i64;
        let net = net.min(max_workers as i64);

        if net <= 0 {
            let deficit = (count as u128 * e as u128).saturating_sub(duration as u128) as u64;
            let sleep_ns = if deficit >= MIN_DELAY_NS { deficit } else { 0 };
            PaceDecision::Pace {
                sleep_ns,
                budget: (MIN_DELAY_NS / e).max(1),
            }
        } else {
            self.desired.store(net as usize, Ordering::Relaxed);
            PaceDecision::Dispatch(net as usize)
        }
    }

    /// Yield budget for paced dispatch: one minimum-delay window's worth of
    /// output at the target rate. Handing control back to the consumer at
    /// that cadence is what lets the estimate steer a fast producer instead
    /// of chasing it.
    pub(crate) fn dispatch_budget(&self) -> u64 {
        (MIN_DELAY_NS / self.target_ns.max(1)).max(1)
    }

    /// Current worker-count target, for surplus shedding.
    pub(crate) fn desired(&self) -> usize {
        self.desired.load(Ordering::Relaxed)
    }

    pub(crate) fn measured_ns(&self) -> u64 {
        self.measured_ns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn first_collect_records_measurement() {
        let rc = RateControl::new(MS, None, 16);
        rc.record(10, 20 * MS);
        rc.collect(1500);
        assert_eq!(rc.measured_ns(), 2 * MS);
    }

    #[test]
    fn small_samples_accumulate_until_massive() {
        let rc = RateControl::new(MS, Some(Duration::from_micros(100)), 16);
        // 2 yields over 200us: below both mass thresholds, same latency.
        rc.record(2, 200_000);
        rc.collect(1500);
        assert_eq!(rc.measured_ns(), 100_000, "no re-measure without mass");
        // Enough accumulated time now.
        rc.record(20, 2 * MS);
        rc.collect(1500);
        assert_eq!(rc.measured_ns(), (200_000 + 2 * MS) / 22);
    }

    #[test]
    fn bootstrap_until_first_measurement() {
        let rc = RateControl::new(MS, None, 16);
        assert_eq!(rc.estimate(16), PaceDecision::Bootstrap);
        rc.record(1, MS);
        rc.collect(1500);
        assert!(!matches!(rc.estimate(16), PaceDecision::Bootstrap));
    }

    #[test]
    fn slow_workers_raise_the_target() {
        // Latency 10x the target: at least 10 workers needed to hold rate.
        let rc = RateControl::new(MS, Some(Duration::from_millis(10)), 64);
        match rc.estimate(64) {
            PaceDecision::Dispatch(n) => {
                assert!(n >= 10, "L/E baseline should demand 10+, got {n}")
            }
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn ahead_of_schedule_paces() {
        let rc = RateControl::new(MS, Some(Duration::from_nanos(100)), 64);
        // Massively ahead: huge count over essentially zero elapsed time.
        rc.record(1_000_000, 100);
        rc.collect(1500);
        match rc.estimate(64) {
            PaceDecision::Pace { sleep_ns, budget } => {
                assert!(sleep_ns >= MIN_DELAY_NS);
                assert_eq!(budget, 1);
            }
            other => panic!("expected pacing, got {other:?}"),
        }
    }

    #[test]
    fn desired_caps_at_max_workers() {
        let rc = RateControl::new(1, Some(Duration::from_millis(100)), 4);
        match rc.estimate(4) {
            PaceDecision::Dispatch(n) => assert!(n <= 4),
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn period_scales_with_latency() {
        let rc = RateControl::new(1000, None, 16);
        // No measurement: period derived from target latency.
        assert_eq!(rc.period(1500), MIN_DELAY_NS / 1000);
        rc.record(10, 10 * MS);
        rc.collect(1500);
        // 1ms per yield measured: report every yield.
        assert_eq!(rc.period(1500), 1);
    }
}
