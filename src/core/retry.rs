//! Retry with capped exponential backoff
//!
//! Only network pulls are retried. The delay before retry `n` (zero based)
//! is `min(base * 2^n, cap)`. An observer sees every failed attempt that
//! will be retried, right before the sleep; the final failure is returned
//! to the caller instead.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;

use crate::config::defaults;

/// Retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound of any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_PULL_ATTEMPTS,
            base_delay: Duration::from_millis(defaults::RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Policy that never sleeps, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    fn schedule(&self) -> impl Backoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Delays slept between attempts
    pub fn delays(&self) -> Vec<Duration> {
        let mut schedule = self.schedule();
        (1..self.max_attempts)
            .map(|_| schedule.next_backoff().unwrap_or(self.max_delay))
            .collect()
    }

    /// Run `operation` until it succeeds or attempts run out
    ///
    /// `on_failure` receives the attempt number (starting at 1) and the
    /// error of every attempt that is going to be retried.
    pub fn retry<T, E, F, O>(&self, mut operation: F, mut on_failure: O) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        O: FnMut(u32, &E),
    {
        let mut schedule = self.schedule();
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    on_failure(attempt, &e);
                    let delay = schedule.next_backoff().unwrap_or(self.max_delay);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Async variant of [`RetryPolicy::retry`]
    pub async fn retry_async<T, E, F, Fut, O>(&self, mut operation: F, mut on_failure: O) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        O: FnMut(u32, &E),
    {
        let mut schedule = self.schedule();
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    on_failure(attempt, &e);
                    let delay = schedule.next_backoff().unwrap_or(self.max_delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
