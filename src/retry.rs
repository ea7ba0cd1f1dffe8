//! Linear-backoff retry for idempotent RTM operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::Result;

/// Retry policy shared by frob acquisition and token exchange.
///
/// Attempt `n` (1-based) is followed by a sleep of `n * backoff` before the
/// next try.  Only errors reported transient by
/// [`Error::is_retryable`](crate::Error::is_retryable) are retried; RTM
/// semantic errors and parse failures surface on the first attempt.
/// Dropping the returned future cancels the operation mid-attempt or
/// mid-sleep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub attempts: u32,
    /// Base backoff; attempt `n` sleeps `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with explicit attempts and base backoff.
    pub fn new(attempts: u32, backoff: Duration) -> RetryPolicy {
        RetryPolicy {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Backoff before the attempt after `attempt` (1-based) has failed.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts are
    /// exhausted.  The final error is wrapped with
    /// `"<label> failed after N attempts"`.
    pub async fn execute<F, Fut, T>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::debug!("{label} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= self.attempts => {
                    return Err(
                        err.context(format!("{label} failed after {} attempts", self.attempts))
                    );
                }
                Err(err) => {
                    let backoff = self.backoff_duration(attempt);
                    log::warn!(
                        "{label} failed (attempt {attempt}/{}): {err}; retrying in {backoff:?}",
                        self.attempts
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
