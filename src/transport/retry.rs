//! Bounded retry with backoff
//!
//! `RetryPolicy::decide` is the pure decision; `retry_with_backoff` drives an
//! async operation with it. Connection open, the per-open handshake attempts
//! and the publisher all go through this one combinator.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),
    /// `step × attempt` after the failed attempt
    Linear(Duration),
}

impl Backoff {
    /// Delay to wait after `failed_attempt` (1-based) failed
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Linear(step) => step.saturating_mul(failed_attempt.max(1)),
        }
    }
}

/// Attempt limit plus backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Linear(step),
        }
    }

    /// Decide what happens after `failed_attempt` failed (pure function)
    pub fn decide(&self, failed_attempt: u32, retryable: bool) -> RetryDecision {
        if !retryable {
            return RetryDecision::AbortNotRetryable;
        }
        if failed_attempt >= self.max_attempts {
            return RetryDecision::AbortMaxAttemptsExceeded;
        }
        RetryDecision::Proceed {
            attempt: failed_attempt + 1,
            delay: self.backoff.delay_for(failed_attempt),
        }
    }

    /// Sum of all delays if every attempt fails
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.backoff.delay_for(attempt))
            .sum()
    }
}

/// Decision after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `delay`, then run attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    /// Error is not worth retrying
    AbortNotRetryable,
    AbortMaxAttemptsExceeded,
}

/// Final failure of a retried operation
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `operation` until it succeeds, `should_retry` rejects its error, or
/// the policy's attempt limit is reached
///
/// The operation receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut should_retry: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: Display,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(error) => match policy.decide(attempt, should_retry(&error)) {
                RetryDecision::Proceed {
                    attempt: next,
                    delay,
                } => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::AbortNotRetryable => {
                    warn!(operation = operation_name, attempt, error = %error, "Error is not retryable");
                    return Err(RetryError {
                        attempts: attempt,
                        last_error: error,
                    });
                }
                RetryDecision::AbortMaxAttemptsExceeded => {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %error,
                        "Giving up after max attempts"
                    );
                    return Err(RetryError {
                        attempts: attempt,
                        last_error: error,
                    });
                }
            },
        }
    }
}
