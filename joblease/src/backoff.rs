//! Delays between in-unit retries of transient failures.
//!
//! A [`BackoffStrategy`] is one of three curves (constant, linear or exponential), optionally
//! clamped with [`BackoffStrategy::with_max`] and spread with a [`Jitter`]. All of the
//! constructors and configuration functions are `const` so strategies can live in a
//! [`crate::config::Config`] constant.
//!
//! # Example
//!
//! ```
//! # use joblease::backoff::{BackoffStrategy, Jitter, Strategy};
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(500))
//!     .with_max(TimeDelta::seconds(30))
//!     .with_jitter(Jitter::Relative(0.1));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::milliseconds(450));
//! assert!(strategy.backoff(1) <= TimeDelta::milliseconds(550));
//! assert!(strategy.backoff(20) <= TimeDelta::seconds(33));
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of the attempt that just failed, starting at 1, returns how long to wait
    /// before the next one.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Curve {
    Constant(TimeDelta),
    Linear(TimeDelta),
    Exponential(TimeDelta),
}

impl Curve {
    fn at(self, attempt: u16) -> TimeDelta {
        let attempt = attempt.max(1);
        match self {
            Self::Constant(delay) => delay,
            Self::Linear(factor) => factor * attempt.into(),
            Self::Exponential(base) => {
                let factor = 2_i64.checked_pow(u32::from(attempt) - 1).unwrap_or(i64::MAX);
                let millis = base.num_milliseconds().saturating_mul(factor);
                TimeDelta::try_milliseconds(millis).unwrap_or(TimeDelta::MAX)
            }
        }
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        }
        .abs();
        let rand_jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value
            .checked_add(&TimeDelta::milliseconds(rand_jitter))
            .unwrap_or(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    curve: Curve,
    max: Option<TimeDelta>,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy {
    const fn new(curve: Curve) -> Self {
        Self {
            curve,
            max: None,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Always waits `delay`.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Curve::Constant(delay))
    }

    /// Waits `factor * attempt`.
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Curve::Linear(factor))
    }

    /// Waits `base * 2^(attempt - 1)`, so the first retry waits exactly `base`.
    ///
    /// ```
    /// # use joblease::backoff::{BackoffStrategy, Strategy};
    /// # use chrono::TimeDelta;
    /// let strategy =
    ///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
    /// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
    /// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
    /// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Curve::Exponential(base))
    }

    /// Clamps the curve to `max_delay` before jitter is applied.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.max = Some(max_delay);
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. This can be useful when you have a particularly large jitter and would
    /// like to avoid a delay of less than a given amount.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl Strategy for BackoffStrategy {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.curve.at(attempt);

        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}
