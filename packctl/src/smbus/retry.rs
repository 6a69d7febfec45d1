//! Bounded retry for bus transactions.

use std::time::Duration;

use crate::hw_trait::Delay;

/// How often, and how patiently, a transaction is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; never less than one.
    pub max_attempts: u32,
    /// Wait between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// A single attempt and no retries.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent.
    pub fn run<T, E, D, F, R>(&self, delay: &mut D, mut op: F, retryable: R) -> Retry<T, E>
    where
        D: Delay,
        F: FnMut() -> Result<T, E>,
        R: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op() {
                Ok(value) => return Retry::Success { value, attempts },
                Err(error) if attempts >= max_attempts || !retryable(&error) => {
                    return Retry::Exhausted { error, attempts };
                }
                Err(_) => delay.delay(self.delay),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(5))
    }
}

/// Outcome of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retry<T, E> {
    Success { value: T, attempts: u32 },
    /// Gave up; `error` is from the last attempt.
    Exhausted { error: E, attempts: u32 },
}
