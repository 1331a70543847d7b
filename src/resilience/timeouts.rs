//! Per-attempt deadlines.

use std::future::Future;
use std::time::Duration;

use crate::api::types::ApiError;
use crate::resilience::retries::RetryPolicy;

/// Run `fut` with a deadline. A timeout surfaces as a transient `TIMEOUT`
/// error so the executor retries it like any network failure.
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::timeout(duration.as_secs())),
    }
}

/// Longest one gated call can run end to end.
///
/// Covers the rate-limit wait, every transient attempt running into its
/// deadline with the backoff between them, and a credential refresh (bounded
/// by `refresh_wait` plus one request) with the extra attempt it earns.
pub fn call_budget(
    rate_wait: Duration,
    retry: &RetryPolicy,
    call_timeout: Duration,
    refresh_wait: Duration,
) -> Duration {
    let attempts = retry.max_attempts.saturating_add(1);
    rate_wait
        + call_timeout.saturating_mul(attempts)
        + retry.worst_case_backoff()
        + refresh_wait
        + call_timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::ErrorClass;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let value = with_timeout(Duration::from_secs(1), async { Ok::<_, ApiError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_call_budget_with_defaults() {
        let budget = call_budget(
            Duration::from_secs(30),
            &RetryPolicy::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        // 30s wait, 6 attempts and one refresh request at 30s, 8.5s backoff, 5s lock.
        assert_eq!(budget, Duration::from_millis(253_500));
        assert!(budget > Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let err = with_timeout(Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, ApiError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
