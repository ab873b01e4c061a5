//! Retry policy and backoff schedule.
//!
//! A policy allows `max_retries` extra attempts after the first one. The
//! delay before retry `n` (1-based) is:
//!
//! | strategy      | delay                          |
//! |---------------|--------------------------------|
//! | `fixed`       | `initial_delay_ms`             |
//! | `linear`      | `initial_delay_ms * n`         |
//! | `exponential` | `initial_delay_ms * 2^(n - 1)` |
//!
//! An optional `max_delay_ms` caps every delay.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How the delay grows between consecutive retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay grows by `initial_delay_ms` per retry.
    Linear,
    /// Delay doubles with every retry.
    Exponential,
}

/// Bounded retry configuration shared by actions and workflow settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    #[serde(default)]
    pub max_retries: u32,
    /// Delay growth strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Base delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// The final result of a retried operation plus how many retries it took.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Result of the last attempt.
    pub result: Result<T, E>,
    /// Retries performed (attempts minus one).
    pub retries: u32,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::Fixed,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: None,
        }
    }

    /// Creates a policy with the given retry count, strategy and base delay.
    #[must_use]
    pub fn new(max_retries: u32, backoff: BackoffStrategy, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff,
            initial_delay_ms,
            max_delay_ms: None,
        }
    }

    /// Caps every delay at `max_delay_ms`.
    #[must_use]
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    /// Delay to wait before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let base = self.initial_delay_ms;
        let millis = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry)),
            BackoffStrategy::Exponential => {
                let shift = (retry - 1).min(32);
                base.saturating_mul(1u64 << shift)
            }
        };
        let millis = self.max_delay_ms.map_or(millis, |cap| millis.min(cap));
        Duration::from_millis(millis)
    }

    /// Runs `operation` until it succeeds, `should_retry` rejects the error,
    /// or the retry budget is spent.
    ///
    /// The closure receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut, P>(&self, mut operation: F, should_retry: P) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut retries = 0;
        loop {
            match operation(retries).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        retries,
                    };
                }
                Err(err) if retries < self.max_retries && should_retry(&err) => {
                    retries += 1;
                    let delay = self.delay_for(retries);
                    warn!(
                        attempt = retries,
                        delay_ms = millis(delay),
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return RetryOutcome {
                        result: Err(err),
                        retries,
                    };
                }
            }
        }
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
