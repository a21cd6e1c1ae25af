//! Top-level consumer loop: run a set of tasks through a conduit and
//! collect the results.

use tracing::debug;

use crate::conduit::{Conduit, Style};
use crate::config::Config;
use crate::error::{SchedError, SchedResult};
use crate::task::{ChildEvent, Step, Task};

/// Run `tasks` under the given style and return every yielded value.
///
/// The first worker error cancels all siblings and is returned after the
/// remaining workers have been reaped. `max_workers = 0` runs everything
/// synchronously on the calling thread, preserving program order.
pub fn gather<T, I>(style: Style, cfg: &Config, tasks: I) -> SchedResult<Vec<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    run(style, cfg, tasks, true)
}

/// Like [`gather`], discarding the values.
pub fn wait<T, I>(style: Style, cfg: &Config, tasks: I) -> SchedResult<()>
where
    T: Send + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    run(style, cfg, tasks, false).map(|_| ())
}

fn run<T, I>(style: Style, cfg: &Config, tasks: I, keep: bool) -> SchedResult<Vec<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    cfg.validate()?;
    if cfg.max_workers == 0 {
        return run_sync(cfg, tasks, keep);
    }

    let conduit = Conduit::new(style, cfg.clone())?;
    for task in tasks {
        conduit.enqueue(task);
    }

    let mut out = Vec::new();
    let mut error: Option<SchedError> = None;
    loop {
        let events = conduit.read_output();
        if events.is_empty() {
            break;
        }
        for ev in events {
            match ev {
                ChildEvent::Yield(v) => {
                    // Nothing delivered after the error is surfaced.
                    if keep && error.is_none() {
                        out.push(v);
                    }
                }
                ChildEvent::Stop(id, Some(e)) => {
                    debug!(worker = id, error = %e, "worker failed");
                    if error.is_none() {
                        error = Some(e);
                        conduit.cancel_all();
                    }
                }
                ChildEvent::Stop(_, None) => {}
            }
        }
        if conduit.post_process() {
            break;
        }
    }

    match error {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Zero-worker mode: every task runs on the enqueuing thread, in order.
fn run_sync<T, I>(cfg: &Config, tasks: I, keep: bool) -> SchedResult<Vec<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    let mut credit = cfg.yield_limit;
    let mut out = Vec::new();
    for task in tasks {
        let mut task = task;
        loop {
            if credit == Some(0) {
                return Ok(out);
            }
            match task.step()? {
                Step::Done => break,
                Step::Yield(v, tail) => {
                    if let Some(c) = credit.as_mut() {
                        *c -= 1;
                    }
                    if keep {
                        out.push(v);
                    }
                    match tail {
                        Some(t) => task = t,
                        None => break,
                    }
                }
            }
        }
    }
    Ok(out)
}
