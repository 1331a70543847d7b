//! Token bucket rate limiting shared through the state store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::config::schema::RateLimitConfig;
use crate::error::{GuardError, GuardResult};
use crate::observability::metrics;
use crate::store::{self, StateStore};

const NAMESPACE: &str = "rate_limiter";

/// A token bucket as persisted per key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct TokenBucket {
    tokens: f64,
    /// Unix seconds of the last refill.
    last: f64,
}

impl TokenBucket {
    fn new(capacity: f64, now: f64) -> Self {
        Self {
            tokens: capacity,
            last: now,
        }
    }

    /// Refill from elapsed time, then take `cost` tokens if available.
    /// Returns the seconds to wait when the bucket is short.
    fn try_acquire(&mut self, cost: f64, capacity: f64, refill_rate: f64, now: f64) -> f64 {
        let elapsed = (now - self.last).max(0.0);
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last = self.last.max(now);

        if self.tokens >= cost {
            self.tokens -= cost;
            0.0
        } else {
            (cost - self.tokens) / refill_rate
        }
    }
}

/// Admission control keyed by tenant.
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    enabled: bool,
    rate: f64,
    burst: f64,
    state_ttl: f64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            enabled: config.enabled,
            rate: config.rate_per_sec.max(0.1),
            burst: config.burst.max(1.0),
            state_ttl: config.state_ttl_secs.max(60) as f64,
        }
    }

    /// Take `cost` tokens for `key`, sleeping until they are available.
    ///
    /// Fails with `RateLimitTimeout` as soon as the required wait exceeds
    /// what is left of `max_wait`.
    pub async fn acquire(&self, key: &str, cost: f64, max_wait: Duration) -> GuardResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let deadline = self.clock.now() + max_wait.as_secs_f64();
        loop {
            let wait = self.reserve(key, cost)?;
            if wait <= 0.0 {
                return Ok(());
            }
            let remaining = deadline - self.clock.now();
            if wait > remaining {
                metrics::record_rate_limited("timeout");
                return Err(GuardError::RateLimitTimeout {
                    key: key.to_string(),
                    needed_ms: (wait * 1000.0).ceil() as u64,
                    max_wait_ms: max_wait.as_millis() as u64,
                });
            }
            metrics::record_rate_limited("wait");
            tracing::debug!(key, wait_ms = (wait * 1000.0) as u64, "Rate limited, waiting");
            self.clock.sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// One locked refill-and-take step. Returns the wait in seconds, 0 when
    /// the tokens were taken.
    fn reserve(&self, key: &str, cost: f64) -> GuardResult<f64> {
        let now = self.clock.now();
        let (burst, rate) = (self.burst, self.rate);
        let wait = store::mutate_as::<TokenBucket, f64>(self.store.as_ref(), NAMESPACE, key, |slot| {
            let bucket = slot.get_or_insert_with(|| TokenBucket::new(burst, now));
            bucket.try_acquire(cost, burst, rate, now)
        })?;

        let ttl = self.state_ttl;
        let pruned = self.store.retain(NAMESPACE, &mut |_, value| {
            value
                .get("last")
                .and_then(Value::as_f64)
                .is_some_and(|last| now - last <= ttl)
        });
        if let Err(e) = pruned {
            tracing::warn!(error = %e, "Failed to prune rate limiter state");
        }
        Ok(wait)
    }

    /// Tokens currently stored for `key`, without refilling.
    pub fn tokens(&self, key: &str) -> GuardResult<Option<f64>> {
        let bucket: Option<TokenBucket> = store::get_as(self.store.as_ref(), NAMESPACE, key)?;
        Ok(bucket.map(|b| b.tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn limiter(clock: Arc<ManualClock>, rate: f64, burst: f64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryStore::new()),
            clock,
            &RateLimitConfig {
                enabled: true,
                rate_per_sec: rate,
                burst,
                max_wait_ms: 30_000,
                state_ttl_secs: 3600,
            },
        )
    }

    #[test]
    fn test_bucket_refill_is_capped() {
        let mut bucket = TokenBucket::new(10.0, 0.0);
        assert_eq!(bucket.try_acquire(1.0, 10.0, 2.0, 0.0), 0.0);
        assert_eq!(bucket.tokens, 9.0);
        assert_eq!(bucket.try_acquire(1.0, 10.0, 2.0, 100.0), 0.0);
        assert_eq!(bucket.tokens, 9.0);
    }

    #[test]
    fn test_clock_going_backwards_does_not_refill() {
        let mut bucket = TokenBucket::new(1.0, 50.0);
        assert_eq!(bucket.try_acquire(1.0, 1.0, 1.0, 50.0), 0.0);
        let wait = bucket.try_acquire(1.0, 1.0, 1.0, 40.0);
        assert!((wait - 1.0).abs() < 1e-9);
        assert_eq!(bucket.last, 50.0);
    }

    #[tokio::test]
    async fn test_burst_then_wait() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let limiter = limiter(clock.clone(), 2.0, 10.0);
        for _ in 0..10 {
            limiter.acquire("portal", 1.0, Duration::from_secs(30)).await.unwrap();
        }
        assert_eq!(clock.total_slept(), Duration::ZERO);

        limiter.acquire("portal", 1.0, Duration::from_secs(30)).await.unwrap();
        limiter.acquire("portal", 1.0, Duration::from_secs(30)).await.unwrap();
        assert!(clock.total_slept() >= Duration::from_millis(999));
    }

    #[tokio::test]
    async fn test_timeout_when_wait_exceeds_budget() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let limiter = limiter(clock.clone(), 0.5, 1.0);
        limiter.acquire("portal", 1.0, Duration::from_secs(1)).await.unwrap();

        let err = limiter
            .acquire("portal", 1.0, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            GuardError::RateLimitTimeout { needed_ms, max_wait_ms, .. } => {
                assert_eq!(needed_ms, 2000);
                assert_eq!(max_wait_ms, 1000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(clock.total_slept(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            &RateLimitConfig {
                enabled: false,
                ..RateLimitConfig::default()
            },
        );
        for _ in 0..100 {
            limiter.acquire("portal", 1.0, Duration::ZERO).await.unwrap();
        }
        assert_eq!(limiter.tokens("portal").unwrap(), None);
    }

    #[tokio::test]
    async fn test_idle_keys_are_pruned() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let limiter = limiter(clock.clone(), 2.0, 10.0);
        limiter.acquire("old", 1.0, Duration::ZERO).await.unwrap();
        clock.advance(Duration::from_secs(3601));
        limiter.acquire("new", 1.0, Duration::ZERO).await.unwrap();
        assert_eq!(limiter.tokens("old").unwrap(), None);
        assert_eq!(limiter.tokens("new").unwrap(), Some(9.0));
    }
}
