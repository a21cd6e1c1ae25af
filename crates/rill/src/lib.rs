//! Concurrent stream scheduling core.
//!
//! A [`Conduit`] is a bounded, rate-adaptive multi-producer/single-consumer
//! channel that owns a work queue of pending [`Task`]s, a pool of worker
//! threads evaluating them, and an output queue of yielded values drained
//! by a single consumer. The dispatcher sizes the pool from observed
//! throughput against a target yield rate (paced mode) or from buffer
//! occupancy (bounded mode); the ordered style additionally reorders
//! results to match enqueue order through a sequence-numbered heap.
//!
//! The crate deliberately stops below the stream-combinator layer: it
//! exposes the scheduler itself plus the [`gather`]/[`wait`] drivers, and
//! leaves composition to callers.

pub mod conduit;
pub mod config;
pub mod driver;
pub mod error;
pub mod output;
pub mod queue;
pub mod stats;
pub mod sync;
pub mod task;

mod dispatch;
mod heap;
mod rate;
mod worker;

pub use conduit::{Conduit, Style};
pub use config::{Config, DEFAULT_MAX_BUFFER, DEFAULT_MAX_WORKERS, MIN_DELAY};
pub use driver::{gather, wait};
pub use error::{SchedError, SchedResult};
pub use output::Doorbell;
pub use stats::StatsSnapshot;
pub use task::{ChildEvent, Step, Task, WorkerId};
