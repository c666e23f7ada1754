//! Fixed-delay retry shared by every component that dials the broker.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often and how long to retry an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub delay: Duration,
    /// Upper bound on attempts; `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: None,
        }
    }
}

/// Why [`retry_with_backoff`] stopped without a result.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryStop<E> {
    /// Shutdown was requested while waiting.
    Cancelled,
    /// The attempt budget ran out; carries the last error.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error returned by the final attempt.
        last_error: E,
    },
}

/// Run `op` until it succeeds, sleeping `policy.delay` between failures.
///
/// Cancellation is observed both while an attempt is pending and while sleeping.
pub async fn retry_with_backoff<T, E, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryStop<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryStop::Cancelled),
            outcome = op() => outcome,
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(component = label, attempt, "Connected after retrying");
                }
                return Ok(value);
            }
            Err(error) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    tracing::error!(component = label, attempt, error = %error, "Giving up");
                    return Err(RetryStop::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }
                tracing::warn!(
                    component = label,
                    attempt,
                    retry_in_ms = policy.delay.as_millis() as u64,
                    error = %error,
                    "Not ready; retrying"
                );
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryStop::Cancelled),
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}
