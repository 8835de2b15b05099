use chrono::TimeDelta;

use crate::{lock::StalenessPolicy, retry::RetryPolicy};

/// Tunables for a [`crate::Joblease`] instance.
///
/// All of the constructors and configuration functions are `const`.
///
/// # Example
///
/// ```
/// # use joblease::prelude::*;
/// # use chrono::TimeDelta;
/// const CONFIG: Config = Config::new()
///     .with_run_stale(TimeDelta::minutes(10))
///     .with_flush_batch_size(20);
///
/// assert_eq!(CONFIG.flush_batch_size(), 20);
/// assert_eq!(CONFIG.staleness().pending_stale(), TimeDelta::minutes(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    staleness: StalenessPolicy,
    flush_batch_size: usize,
    unit_retry: RetryPolicy,
}

impl Config {
    pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 5;

    pub const fn new() -> Self {
        Self {
            staleness: StalenessPolicy::DEFAULT,
            flush_batch_size: Self::DEFAULT_FLUSH_BATCH_SIZE,
            unit_retry: RetryPolicy::DEFAULT,
        }
    }

    /// How long a running job may go without a heartbeat before the next acquire reclaims it.
    pub const fn with_run_stale(mut self, run_stale: TimeDelta) -> Self {
        self.staleness = self.staleness.with_run_stale(run_stale);
        self
    }

    /// How long a job may sit in pending, counted from creation, before it is reclaimed.
    pub const fn with_pending_stale(mut self, pending_stale: TimeDelta) -> Self {
        self.staleness = self.staleness.with_pending_stale(pending_stale);
        self
    }

    /// Number of recorded items between automatic progress flushes. Zero is treated as one.
    pub const fn with_flush_batch_size(mut self, flush_batch_size: usize) -> Self {
        self.flush_batch_size = flush_batch_size;
        self
    }

    pub const fn with_unit_retry(mut self, unit_retry: RetryPolicy) -> Self {
        self.unit_retry = unit_retry;
        self
    }

    pub const fn staleness(&self) -> StalenessPolicy {
        self.staleness
    }

    pub const fn flush_batch_size(&self) -> usize {
        self.flush_batch_size
    }

    pub const fn unit_retry(&self) -> RetryPolicy {
        self.unit_retry
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
