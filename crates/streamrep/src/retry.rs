//! Bounded retry with fixed backoff
//!
//! Both event application and checkpointing use the same budget: a maximum
//! number of attempts and a fixed delay between them. The delay runs on the
//! calling shard's own task, so a failing shard stalls only itself.

use std::future::Future;
use std::time::Duration;

/// Attempt budget for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Delay between two attempts
    pub backoff: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_MAX_RETRY_ATTEMPTS,
            backoff: Duration::from_millis(crate::config::DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

impl RetryBudget {
    /// Create a budget; at least one attempt is always made
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A single attempt, no retries
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Whether a failed attempt may be followed by another one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry,
    GiveUp,
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// The successful result, if any
    pub result: Option<T>,
    /// Number of attempts made
    pub attempts: u32,
    /// Last error encountered (if failed)
    pub last_error: Option<E>,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }

    /// True when the budget ran out on retryable failures
    pub fn exhausted(&self, budget: &RetryBudget) -> bool {
        self.result.is_none() && self.attempts >= budget.max_attempts
    }
}

/// Run `operation` until it succeeds, `classify` gives up on an error, or
/// the budget is spent. Sleeps `budget.backoff` between attempts, never
/// after the last one. `on_failure` sees each failed attempt (1-indexed).
pub async fn retry<T, E, F, Fut, C, L>(
    budget: &RetryBudget,
    mut classify: C,
    mut on_failure: L,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> Verdict,
    L: FnMut(u32, &E),
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation(attempts).await {
            Ok(value) => {
                return RetryResult {
                    result: Some(value),
                    attempts,
                    last_error: None,
                };
            }
            Err(error) => {
                on_failure(attempts, &error);

                let should_retry =
                    classify(&error) == Verdict::Retry && attempts < budget.max_attempts;

                if !should_retry {
                    return RetryResult {
                        result: None,
                        attempts,
                        last_error: Some(error),
                    };
                }

                if !budget.backoff.is_zero() {
                    tokio::time::sleep(budget.backoff).await;
                }
            }
        }
    }
}
