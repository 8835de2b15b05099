//! Bounded in-unit retries of transient failures.
use std::future::Future;

use chrono::TimeDelta;
use thiserror::Error;

use crate::{
    backoff::{BackoffStrategy, Jitter, Strategy},
    classify::{ErrorClass, ErrorClassifier, UnitError},
};

/// A unit failure that retrying did not (or could not) fix.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{class:?} unit failure after {attempts} attempt(s): {error}")]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub attempts: u16,
    #[source]
    pub error: UnitError,
}

/// How many times a unit is tried and how long to wait between tries.
///
/// Only [`ErrorClass::Transient`] failures are retried; a fatal failure ends the unit on the
/// attempt that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u16,
    backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// Three attempts, waiting 500ms then 1s, with 10% jitter and a 30s cap.
    pub const DEFAULT: Self = Self::new(
        3,
        BackoffStrategy::exponential(TimeDelta::milliseconds(500))
            .with_max(TimeDelta::seconds(30))
            .with_jitter(Jitter::Relative(0.1)),
    );

    pub const fn new(max_attempts: u16, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Every failure is surfaced on the first attempt.
    pub const fn no_retry() -> Self {
        Self::new(1, BackoffStrategy::constant(TimeDelta::zero()))
    }

    pub const fn max_attempts(&self) -> u16 {
        self.max_attempts
    }

    /// Runs `unit` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// `unit` receives the attempt number, starting at 1.
    pub async fn run<T, F, Fut>(
        &self,
        classifier: &dyn ErrorClassifier,
        mut unit: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut(u16) -> Fut,
        Fut: Future<Output = Result<T, UnitError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match unit(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let class = classifier.classify(&error);
            if class == ErrorClass::Fatal || attempt >= max_attempts {
                return Err(ClassifiedError {
                    class,
                    attempts: attempt,
                    error,
                });
            }
            let delay = self.backoff.backoff(attempt);
            tracing::debug!(attempt, %delay, %error, "Retrying transient unit failure");
            tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}
