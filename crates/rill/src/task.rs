//! Producer computations and the events they generate.

use crate::error::SchedError;

/// Identifies a worker within one scheduler instance.
///
/// Worker ids are a dense per-scheduler sequence, not OS thread ids, so
/// `Stop` events stay meaningful after the underlying thread is gone.
pub type WorkerId = u64;

/// One evaluation step of a producer computation.
pub enum Step<T> {
    /// A value, plus the computation that produces the rest of the stream.
    /// `None` means the value was the last one.
    Yield(T, Option<Task<T>>),
    /// The computation is exhausted without producing another value.
    Done,
}

/// A producer computation, evaluated one step at a time.
///
/// Tasks are single-shot: stepping consumes the task and hands back the
/// remainder (if any) as a fresh `Task`. That makes suspension trivial:
/// a worker that has to stop mid-stream simply re-queues the remainder.
pub struct Task<T> {
    f: Box<dyn FnOnce() -> Result<Step<T>, SchedError> + Send + 'static>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new(f: impl FnOnce() -> Result<Step<T>, SchedError> + Send + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// A task that yields every item of `iter` in order.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::unfold_iter(iter.into_iter())
    }

    fn unfold_iter<I>(mut it: I) -> Self
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        Task::new(move || {
            Ok(match it.next() {
                Some(v) => Step::Yield(v, Some(Task::unfold_iter(it))),
                None => Step::Done,
            })
        })
    }

    /// Prepend an already-evaluated value to a computation.
    pub fn cons(value: T, tail: Option<Task<T>>) -> Self {
        Task::new(move || Ok(Step::Yield(value, tail)))
    }

    /// A task that fails on its first step.
    pub fn fail(err: SchedError) -> Self {
        Task::new(move || Err(err))
    }

    pub(crate) fn step(self) -> Result<Step<T>, SchedError> {
        (self.f)()
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Task")
    }
}

/// An event posted by a worker for the consumer.
#[derive(Debug)]
pub enum ChildEvent<T> {
    /// A value produced by some task.
    Yield(T),
    /// A worker terminated; carries its error if it failed.
    Stop(WorkerId, Option<SchedError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(mut task: Task<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        loop {
            match task.step().expect("step failed") {
                Step::Done => return out,
                Step::Yield(v, tail) => {
                    out.push(v);
                    match tail {
                        Some(t) => task = t,
                        None => return out,
                    }
                }
            }
        }
    }

    #[test]
    fn from_iter_walks_in_order() {
        assert_eq!(collect(Task::from_iter(1..=5)), vec![1, 2, 3, 4, 5]);
        assert_eq!(collect(Task::from_iter(std::iter::empty())), Vec::<u32>::new());
    }

    #[test]
    fn cons_prepends() {
        let t = Task::cons(0, Some(Task::from_iter(1..=2)));
        assert_eq!(collect(t), vec![0, 1, 2]);
    }

    #[test]
    fn fail_surfaces_error() {
        let t: Task<u32> = Task::fail(SchedError::task_msg("nope"));
        assert!(t.step().is_err());
    }
}
