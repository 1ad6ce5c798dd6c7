//! Bounded retry for operations that can hit a conflict
//!
//! The operation is attempted up to `max_attempts` times. When it fails with
//! an error the caller classifies as a conflict, the caller's `refetch` step
//! runs (e.g. re-reading the resource) and the operation is retried after a
//! fixed backoff. Any other error, or a conflict on the final attempt, is
//! returned unchanged.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry limits
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_millis(100),
        }
    }
}

pub async fn retry_on_conflict<T, E, Op, OpFut, Refetch, RefetchFut>(
    policy: &RetryPolicy,
    mut operation: Op,
    is_conflict: impl Fn(&E) -> bool,
    mut refetch: Refetch,
) -> Result<T, E>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T, E>>,
    Refetch: FnMut() -> RefetchFut,
    RefetchFut: Future<Output = Result<(), E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_conflict(&e) => {
                debug!(attempt, max_attempts, "Conflict, refetching before retry");
                refetch().await?;
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Conflict,
        Fatal,
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.backoff, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_succeeds_after_conflicts() {
        let calls = Arc::new(AtomicU32::new(0));
        let refetches = Arc::new(AtomicU32::new(0));

        let result = retry_on_conflict(
            &fast_policy(5),
            || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::Conflict)
                    } else {
                        Ok("updated")
                    }
                }
            },
            |e| *e == TestError::Conflict,
            || {
                let refetches = refetches.clone();
                async move {
                    refetches.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(result, Ok("updated"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(refetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_conflict_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), TestError> = retry_on_conflict(
            &fast_policy(5),
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Fatal)
                }
            },
            |e| *e == TestError::Conflict,
            || async { Ok(()) },
        )
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), TestError> = retry_on_conflict(
            &fast_policy(3),
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Conflict)
                }
            },
            |e| *e == TestError::Conflict,
            || async { Ok(()) },
        )
        .await;

        assert_eq!(result, Err(TestError::Conflict));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refetch_failure_aborts() {
        let result: Result<(), TestError> = retry_on_conflict(
            &fast_policy(5),
            || async { Err(TestError::Conflict) },
            |e| *e == TestError::Conflict,
            || async { Err(TestError::Fatal) },
        )
        .await;

        assert_eq!(result, Err(TestError::Fatal));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, TestError> = tokio_test::block_on(retry_on_conflict(
            &fast_policy(0),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Conflict) }
            },
            |e| *e == TestError::Conflict,
            || async { Ok(()) },
        ));

        assert_eq!(result, Err(TestError::Conflict));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
