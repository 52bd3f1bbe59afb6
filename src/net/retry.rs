//! Bounded retry for flaky network and page-wait operations

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetrySettings;

/// Attempt budget and fixed pause between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(settings.attempts, settings.delay.as_duration())
    }
}

/// Run `operation` until it produces an outcome that `is_retryable` rejects,
/// the attempt budget is spent, or `should_retry` vetoes another attempt.
///
/// The last outcome is returned as-is, so a retryable-but-successful value (an HTTP
/// response with a 5xx status, say) reaches the caller once attempts run out.
pub async fn retry_outcome<T, E, F, Fut, C, P>(
    policy: &RetryPolicy,
    mut operation: F,
    mut is_retryable: C,
    mut should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&Result<T, E>) -> bool,
    P: FnMut(&Result<T, E>) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = operation().await;

        if !is_retryable(&outcome) {
            if attempt > 1 {
                debug!(attempt, "Operation succeeded after retry");
            }
            return outcome;
        }

        if attempt >= policy.attempts {
            warn!(attempt, "Retry budget exhausted");
            return outcome;
        }

        if !should_retry(&outcome) {
            debug!(attempt, "Retry vetoed by caller");
            return outcome;
        }

        warn!(attempt, remaining = policy.attempts - attempt, "Operation failed, retrying");
        tokio::time::sleep(policy.delay).await;
    }
}

/// Retry an operation whose only failure signal is `Err`
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_outcome(policy, operation, |outcome| outcome.is_err(), |_| true).await
}

#[derive(Debug, Error)]
pub enum WaitError<E> {
    #[error("condition not met within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Condition(E),
}

/// Wait on an asynchronous page condition, re-arming the timeout for each attempt
///
/// Both timeouts and condition errors are retried; `should_retry` can stop early.
pub async fn wait_tenaciously<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    timeout: Duration,
    mut condition: F,
    should_retry: P,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&Result<T, WaitError<E>>) -> bool,
{
    retry_outcome(
        policy,
        || {
            let fut = condition();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(WaitError::Condition(e)),
                    Err(_) => Err(WaitError::Timeout(timeout)),
                }
            }
        },
        |outcome| outcome.is_err(),
        should_retry,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(calls: Arc<AtomicU32>, failures: u32) -> impl FnMut() -> std::future::Ready<Result<u32, String>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                std::future::ready(Err(format!("failure {n}")))
            } else {
                std::future::ready(Ok(n))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_when_budget_exceeds_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_secs(1));

        let result = retry(&policy, flaky(calls.clone(), 3)).await;

        assert_eq!(result, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_after_exactly_n_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_secs(1));

        let result = retry(&policy, flaky(calls.clone(), 3)).await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(4, Duration::from_secs(2));
        let start = tokio::time::Instant::now();

        let _ = retry(&policy, flaky(calls, 2)).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_can_stop_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(10, Duration::from_millis(10));

        let result = retry_outcome(
            &policy,
            flaky(calls.clone(), 5),
            |outcome| outcome.is_err(),
            |outcome| !matches!(outcome, Err(msg) if msg == "failure 2"),
        )
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_success_is_returned_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let counter = calls.clone();

        let result: Result<u16, String> = retry_outcome(
            &policy,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok(503))
            },
            |outcome| matches!(outcome, Ok(status) if *status >= 400),
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(503));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_then_gives_up() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1));

        let result: Result<(), WaitError<String>> = wait_tenaciously(
            &policy,
            Duration::from_secs(5),
            || std::future::pending::<Result<(), String>>(),
            |_| true,
        )
        .await;

        assert!(matches!(result, Err(WaitError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_succeeds_on_second_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_secs(1));

        let result = wait_tenaciously(
            &policy,
            Duration::from_secs(5),
            flaky(calls.clone(), 1),
            |_| true,
        )
        .await;

        assert!(matches!(result, Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
