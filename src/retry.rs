//! Shared retry policy for external collaborator calls.
//!
//! Both the OCR engine and the LLM endpoint fail the same way: transient
//! network or load errors that succeed on a second attempt, and permanent
//! errors that never will. Hoisting the retry loop into one policy value
//! keeps the two call sites identical and makes the backoff schedule
//! testable without either collaborator.
//!
//! Backoff doubles after each attempt (`backoff_ms * 2^(attempt-1)`): with
//! the 500 ms default and 3 retries the wait sequence is 500 ms → 1 s → 2 s.

use std::fmt::Display;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Classifies an error as worth retrying or not.
///
/// Permanent errors (bad credentials, malformed input, a missing binary)
/// return `false` and fail on the first attempt.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry attempts after the first failure. 0 disables retrying.
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds; doubles per attempt.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms * 2u64.pow(attempt.saturating_sub(1)))
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// On failure returns the last error together with the number of
    /// attempts made (at least 1), so callers can report "failed after N
    /// attempts" without counting themselves.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, (E, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    if !e.is_transient() || attempt > self.max_retries {
                        return Err((e, attempt));
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "{label}: attempt {attempt}/{} failed ({e}), retrying in {delay:?}",
                        self.max_retries + 1
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
