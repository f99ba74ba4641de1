use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Bounded retry with exponential backoff for transient network failures.
/// Permanent failures (auth rejections, malformed bodies) are returned to
/// the caller on the first occurrence.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Runs `op` until it succeeds, fails permanently per `transient`, or the
/// attempt budget is exhausted, in which case the last transient error is
/// returned.
pub async fn with_backoff<T, E, F, Fut, P>(
    policy: RetryPolicy,
    mut op: F,
    transient: P,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut delay = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if transient(&err) && attempt < policy.attempts => {
                warn!("request failed with: {err} ... will retry in {delay:#?}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::http::{NetworkError, StatusCode};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(
            fast_policy(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(NetworkError::Timeout)
                    } else {
                        Ok("recovered")
                    }
                }
            },
            NetworkError::is_transient,
        )
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(
            fast_policy(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NetworkError::Unreachable("connection refused".into())) }
            },
            NetworkError::is_transient,
        )
        .await;

        assert!(matches!(result, Err(NetworkError::Unreachable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(
            fast_policy(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NetworkError::Status(StatusCode::UNAUTHORIZED)) }
            },
            NetworkError::is_transient,
        )
        .await;

        assert!(matches!(
            result,
            Err(NetworkError::Status(StatusCode::UNAUTHORIZED))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limiting_is_transient() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(
            fast_policy(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(NetworkError::Status(StatusCode::TOO_MANY_REQUESTS))
                    } else {
                        Ok(())
                    }
                }
            },
            NetworkError::is_transient,
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
