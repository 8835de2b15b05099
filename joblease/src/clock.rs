//! Time source used for every timestamp the engine writes and every staleness decision.
use std::{
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, TimeDelta, Utc};

pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying instant, so a test can hold one handle while the engine
/// holds another.
///
/// # Example
///
/// ```
/// # use joblease::clock::{Clock, ManualClock};
/// # use chrono::TimeDelta;
/// let clock = ManualClock::default();
/// let start = clock.now();
///
/// clock.advance(TimeDelta::minutes(6));
///
/// assert_eq!(clock.now() - start, TimeDelta::minutes(6));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += delta;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = instant;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // Whole milliseconds so timestamps survive a round trip through Postgres unchanged.
        let now = Utc::now();
        let millis = now.timestamp_millis();
        Self::new(DateTime::from_timestamp_millis(millis).unwrap_or(now))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
