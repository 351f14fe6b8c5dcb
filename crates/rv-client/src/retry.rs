//! Backoff for rate-limited requests.

use std::future::Future;
use std::time::Duration;

use crate::error::{ClientError, Result};

/// Doubling backoff, retried only for [`ClientError::RateLimited`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)`, raised to at least the server hint, capped at
    /// `max_delay`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        let delay = match hint {
            Some(hint) => backoff.max(hint),
            None => backoff,
        };
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Err(ClientError::RateLimited { retry_after }) if attempt < max_attempts => {
                    let delay = self.delay_for(attempt, retry_after);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let p = policy(5);
        assert_eq!(p.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, None), Duration::from_millis(400));
        assert_eq!(p.delay_for(5, None), Duration::from_millis(1000));
    }

    #[test]
    fn hint_is_a_lower_bound_under_the_cap() {
        let p = policy(5);
        assert_eq!(
            p.delay_for(1, Some(Duration::from_millis(300))),
            Duration::from_millis(300)
        );
        assert_eq!(
            p.delay_for(3, Some(Duration::from_millis(50))),
            Duration::from_millis(400)
        );
        assert_eq!(
            p.delay_for(1, Some(Duration::from_secs(60))),
            Duration::from_millis(1000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_until_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy(3)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClientError::RateLimited { retry_after: None }) }
            })
            .await;
        assert!(matches!(result, Err(ClientError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_limit() {
        let result = policy(3)
            .run(|attempt| async move {
                if attempt < 2 {
                    Err(ClientError::RateLimited { retry_after: None })
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy(3)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClientError::SessionExpired("s".into())) }
            })
            .await;
        assert!(matches!(result, Err(ClientError::SessionExpired(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
