use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

/// Default cap on concurrently running workers.
pub const DEFAULT_MAX_WORKERS: usize = 1500;

/// Default cap on outstanding output events before producers back off.
pub const DEFAULT_MAX_BUFFER: i64 = 1500;

/// Minimum scheduling granularity.
///
/// Sleeps shorter than this are not worth paying a context switch for, and
/// latency windows smaller than this carry too much measurement noise.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

pub(crate) const MIN_DELAY_NS: u64 = MIN_DELAY.as_nanos() as u64;

/// Scheduler configuration.
///
/// All fields have working defaults; `validate` rejects combinations the
/// dispatcher cannot honor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of concurrent workers. `0` disables worker threads
    /// entirely and runs every task synchronously on the consuming thread.
    pub max_workers: usize,
    /// Maximum outstanding output events before producers stop. `-1` means
    /// unbounded.
    pub max_buffer: i64,
    /// Target yield rate in yields per second. `None` selects bounded mode,
    /// where dispatch is driven purely by buffer occupancy.
    pub rate: Option<f64>,
    /// Optional bootstrap estimate of per-yield worker latency. Paced mode
    /// uses it as the seed measurement so it can ramp before the first
    /// worker reports.
    pub worker_latency: Option<Duration>,
    /// Optional cap on the total number of yields across the whole stream.
    /// Reaching it is a clean end of stream, not an error.
    pub yield_limit: Option<u64>,
    /// Minimum workers kept dispatched in paced mode while no latency
    /// measurement exists yet. Guards against a stalled seed worker keeping
    /// the whole stream dark.
    pub min_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_buffer: DEFAULT_MAX_BUFFER,
            rate: None,
            worker_latency: None,
            yield_limit: None,
            min_workers: 1,
        }
    }
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> SchedResult<()> {
        if let Some(rate) = self.rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(SchedError::invalid_config(format!(
                    "rate must be a positive finite number of yields/s, got {rate}"
                )));
            }
        }
        if self.max_buffer < -1 {
            return Err(SchedError::invalid_config(format!(
                "max_buffer must be -1 (unbounded) or non-negative, got {}",
                self.max_buffer
            )));
        }
        if self.max_buffer == 0 {
            return Err(SchedError::invalid_config(
                "max_buffer of 0 would never admit a yield",
            ));
        }
        if self.min_workers == 0 {
            return Err(SchedError::invalid_config("min_workers must be at least 1"));
        }
        Ok(())
    }

    /// Target per-yield latency in nanoseconds, if a rate is configured.
    pub(crate) fn target_latency_ns(&self) -> Option<u64> {
        self.rate.map(|r| (1e9 / r).max(1.0) as u64)
    }
}
