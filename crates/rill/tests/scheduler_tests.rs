//! End-to-end scheduler behavior: ordering contracts per style, bounded
//! buffers, pacing, yield limits, error propagation, and cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rill::{gather, wait, ChildEvent, Conduit, Config, SchedError, Step, Style, Task};

fn small_pool() -> Config {
    Config {
        max_workers: 4,
        ..Config::default()
    }
}

/// A task that yields each value in order and then fails.
fn yields_then_fails(values: Vec<u32>) -> Task<u32> {
    fn go(mut vals: std::vec::IntoIter<u32>) -> Task<u32> {
        Task::new(move || match vals.next() {
            Some(v) => Ok(Step::Yield(v, Some(go(vals)))),
            None => Err(SchedError::task_msg("producer blew up")),
        })
    }
    go(values.into_iter())
}

// ---------------------------------------------------------------------------
// Basic delivery
// ---------------------------------------------------------------------------

#[test]
fn parallel_single_task_single_value() {
    let out = gather(
        Style::Parallel,
        &Config::default(),
        vec![Task::from_iter(std::iter::once(42u32))],
    )
    .expect("gather failed");
    assert_eq!(out, vec![42]);
}

#[test]
fn parallel_no_tasks_terminates() {
    let out: Vec<u32> = gather(Style::Parallel, &Config::default(), vec![]).expect("gather failed");
    assert!(out.is_empty());
}

#[test]
fn wait_discards_values() {
    wait(
        Style::Fifo,
        &small_pool(),
        vec![Task::from_iter(0u32..100)],
    )
    .expect("wait failed");
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[test]
fn ahead_merge_preserves_source_order() {
    // Repeat to shake out scheduling interleavings.
    for _ in 0..25 {
        let out = gather(
            Style::Ahead,
            &small_pool(),
            vec![Task::from_iter(1u32..=3), Task::from_iter(4u32..=6)],
        )
        .expect("gather failed");
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }
}

#[test]
fn ahead_many_tasks_stay_ordered() {
    let tasks: Vec<Task<u32>> = (0..20u32)
        .map(|i| Task::from_iter(i * 10..i * 10 + 5))
        .collect();
    let expected: Vec<u32> = (0..20u32).flat_map(|i| i * 10..i * 10 + 5).collect();
    let out = gather(Style::Ahead, &small_pool(), tasks).expect("gather failed");
    assert_eq!(out, expected);
}

#[test]
fn ahead_order_survives_tiny_buffer() {
    // Constant token abandonment: every other yield overflows the buffer.
    let cfg = Config {
        max_workers: 4,
        max_buffer: 2,
        ..Config::default()
    };
    let out = gather(
        Style::Ahead,
        &cfg,
        vec![Task::from_iter(0u32..50), Task::from_iter(50u32..100)],
    )
    .expect("gather failed");
    assert_eq!(out, (0u32..100).collect::<Vec<_>>());
}

#[test]
fn unordered_styles_preserve_the_multiset() {
    for style in [Style::Lifo, Style::Fifo] {
        let tasks: Vec<Task<u32>> = (0..8u32)
            .map(|i| Task::from_iter(i * 50..(i + 1) * 50))
            .collect();
        let mut out = gather(style, &small_pool(), tasks).expect("gather failed");
        out.sort_unstable();
        assert_eq!(
            out,
            (0u32..400).collect::<Vec<_>>(),
            "{style:?} must deliver every value exactly once"
        );
    }
}

#[test]
fn single_task_yields_stay_in_order_regardless_of_style() {
    for style in [Style::Lifo, Style::Fifo, Style::Ahead, Style::Parallel] {
        let out = gather(style, &small_pool(), vec![Task::from_iter(0u32..200)])
            .expect("gather failed");
        assert_eq!(out, (0u32..200).collect::<Vec<_>>(), "{style:?}");
    }
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[test]
fn bounded_buffer_delivers_everything() {
    // Eight tasks over a 2-slot buffer: several workers produce at once,
    // so the per-worker overshoot term of the bound is actually in play.
    const MAX_BUFFER: i64 = 2;
    const MAX_WORKERS: usize = 4;
    let cfg = Config {
        max_workers: MAX_WORKERS,
        max_buffer: MAX_BUFFER,
        ..Config::default()
    };
    let conduit = Conduit::new(Style::Lifo, cfg).expect("conduit");
    for i in 0..8u32 {
        conduit.enqueue(Task::from_iter(i * 125..(i + 1) * 125));
    }

    let mut out = Vec::new();
    loop {
        let events = conduit.read_output();
        if events.is_empty() {
            break;
        }
        for ev in events {
            match ev {
                ChildEvent::Yield(v) => out.push(v),
                ChildEvent::Stop(_, Some(e)) => panic!("unexpected worker error: {e}"),
                ChildEvent::Stop(_, None) => {}
            }
        }
        if conduit.post_process() {
            break;
        }
    }
    out.sort_unstable();
    assert_eq!(out, (0u32..1000).collect::<Vec<_>>());

    // Queued values may exceed the cap by at most one in-flight push per
    // concurrent worker; anything past maxBuffer + workerCount means the
    // buffer check is broken.
    let stats = conduit.stats();
    assert!(
        stats.max_backlog <= (MAX_BUFFER as usize) + MAX_WORKERS,
        "backlog {} exceeds maxBuffer + workerCount = {}",
        stats.max_backlog,
        (MAX_BUFFER as usize) + MAX_WORKERS
    );
}

// ---------------------------------------------------------------------------
// Yield limit
// ---------------------------------------------------------------------------

#[test]
fn yield_limit_truncates_cleanly() {
    let cfg = Config {
        max_workers: 4,
        yield_limit: Some(5),
        ..Config::default()
    };
    let out = gather(Style::Fifo, &cfg, vec![Task::from_iter(0u32..100)]).expect("gather failed");
    assert_eq!(out.len(), 5, "limit must cap total yields");
    assert_eq!(out, vec![0, 1, 2, 3, 4]);
}

#[test]
fn yield_limit_zero_workers() {
    let cfg = Config {
        max_workers: 0,
        yield_limit: Some(3),
        ..Config::default()
    };
    let out = gather(
        Style::Fifo,
        &cfg,
        vec![Task::from_iter(0u32..10), Task::from_iter(10u32..20)],
    )
    .expect("gather failed");
    assert_eq!(out, vec![0, 1, 2]);
}

// ---------------------------------------------------------------------------
// Synchronous fallback
// ---------------------------------------------------------------------------

#[test]
fn zero_worker_limit_runs_synchronously_in_order() {
    let cfg = Config {
        max_workers: 0,
        ..Config::default()
    };
    let out = gather(
        Style::Lifo,
        &cfg,
        vec![Task::from_iter(0u32..5), Task::from_iter(5u32..10)],
    )
    .expect("gather failed");
    assert_eq!(out, (0u32..10).collect::<Vec<_>>(), "program order required");
}

// ---------------------------------------------------------------------------
// Errors and cancellation
// ---------------------------------------------------------------------------

#[test]
fn worker_error_propagates_after_cancel() {
    let err = gather(
        Style::Ahead,
        &small_pool(),
        vec![yields_then_fails(vec![1, 2]), Task::from_iter(10u32..=30)],
    )
    .expect_err("error must propagate");
    assert!(matches!(err, SchedError::Task(_)), "got {err:?}");
}

#[test]
fn worker_panic_propagates() {
    let task: Task<u32> = Task::new(|| panic!("task exploded"));
    let err = gather(Style::Fifo, &small_pool(), vec![task]).expect_err("panic must propagate");
    match err {
        SchedError::WorkerPanic(msg) => assert!(msg.contains("task exploded"), "got {msg}"),
        other => panic!("expected WorkerPanic, got {other:?}"),
    }
}

#[test]
fn ahead_error_delivers_only_the_ordered_prefix() {
    let conduit = Conduit::new(Style::Ahead, small_pool()).expect("conduit");
    conduit.enqueue(yields_then_fails(vec![1, 2]));
    conduit.enqueue(Task::from_iter(vec![10u32, 20, 30]));

    let mut yielded = Vec::new();
    let mut error = None;
    while error.is_none() {
        let events = conduit.read_output();
        if events.is_empty() {
            break;
        }
        for ev in events {
            match ev {
                ChildEvent::Yield(v) => {
                    if error.is_none() {
                        yielded.push(v);
                    }
                }
                ChildEvent::Stop(_, Some(e)) => {
                    error = Some(e);
                    conduit.cancel_all();
                }
                ChildEvent::Stop(_, None) => {}
            }
        }
    }
    assert!(error.is_some(), "the failing task must surface its error");
    // The failing task owns sequence 0, so only its values may have been
    // delivered, in order.
    assert!(
        yielded.is_empty() || yielded == [1] || yielded == [1, 2],
        "unexpected prefix {yielded:?}"
    );

    // Cancellation completeness: all workers unwind in finite time.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let _ = conduit.read_output();
        if conduit.post_process() {
            break;
        }
        assert!(Instant::now() < deadline, "workers did not unwind after cancel");
    }
}

#[test]
fn cancel_before_read_terminates() {
    let conduit = Conduit::new(Style::Fifo, small_pool()).expect("conduit");
    conduit.enqueue(Task::from_iter(0u32..1_000_000));
    conduit.cancel_all();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let _ = conduit.read_output();
        if conduit.post_process() {
            break;
        }
        assert!(Instant::now() < deadline, "cancel did not converge");
    }
}

// ---------------------------------------------------------------------------
// Post-process idempotence
// ---------------------------------------------------------------------------

#[test]
fn post_process_stays_true() {
    let conduit = Conduit::new(Style::Fifo, small_pool()).expect("conduit");
    conduit.enqueue(Task::from_iter(0u32..10));
    loop {
        let events = conduit.read_output();
        if events.is_empty() {
            break;
        }
        if conduit.post_process() {
            break;
        }
    }
    assert!(conduit.post_process());
    assert!(conduit.post_process(), "done must be sticky");
}

// ---------------------------------------------------------------------------
// Paced mode
// ---------------------------------------------------------------------------

#[test]
fn paced_mode_approximates_target_rate() {
    const COUNT: u32 = 600;
    const RATE: f64 = 2000.0;
    let cfg = Config {
        max_workers: 4,
        rate: Some(RATE),
        ..Config::default()
    };
    let start = Instant::now();
    let out = gather(Style::Fifo, &cfg, vec![Task::from_iter(0u32..COUNT)]).expect("gather failed");
    let elapsed = start.elapsed();
    assert_eq!(out.len(), COUNT as usize);

    // Ideal duration is COUNT / RATE = 300ms. Allow a factor of four in
    // both directions to absorb scheduler noise.
    let ideal = Duration::from_secs_f64(COUNT as f64 / RATE);
    assert!(
        elapsed >= ideal / 4,
        "stream ran unpaced: {elapsed:?} vs ideal {ideal:?}"
    );
    assert!(
        elapsed <= ideal * 4,
        "pacing overshot: {elapsed:?} vs ideal {ideal:?}"
    );
}

#[test]
fn paced_mode_with_latency_hint_completes() {
    let cfg = Config {
        max_workers: 4,
        rate: Some(10_000.0),
        worker_latency: Some(Duration::from_micros(10)),
        ..Config::default()
    };
    let out = gather(Style::Lifo, &cfg, vec![Task::from_iter(0u32..500)]).expect("gather failed");
    assert_eq!(out.len(), 500);
}

// ---------------------------------------------------------------------------
// Conduit front door
// ---------------------------------------------------------------------------

#[test]
fn new_ahead_dispatches_a_seed_worker() {
    let conduit = Conduit::new_ahead(small_pool(), Task::from_iter(7u32..10)).expect("conduit");
    let mut out = Vec::new();
    loop {
        let events = conduit.read_output();
        if events.is_empty() {
            break;
        }
        for ev in events {
            if let ChildEvent::Yield(v) = ev {
                out.push(v);
            }
        }
        if conduit.post_process() {
            break;
        }
    }
    assert_eq!(out, vec![7, 8, 9]);
    assert!(conduit.stats().total_dispatches >= 1);
}

#[test]
fn parallel_conduit_is_shareable() {
    let conduit = Conduit::new_parallel(Config::default()).expect("conduit");
    let producer = Arc::clone(&conduit);
    producer.enqueue(Task::from_iter(0u32..50));
    producer.enqueue(Task::from_iter(50u32..100));

    let mut out = Vec::new();
    loop {
        let events = conduit.read_output();
        if events.is_empty() {
            break;
        }
        for ev in events {
            if let ChildEvent::Yield(v) = ev {
                out.push(v);
            }
        }
        if conduit.post_process() {
            break;
        }
    }
    out.sort_unstable();
    assert_eq!(out, (0u32..100).collect::<Vec<_>>());
}
