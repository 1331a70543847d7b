//! Wall-clock source and sleeper.
//!
//! Rate limiter state, plan expiry and idempotency TTLs are all stored as
//! unix seconds so several processes sharing one state directory agree on
//! time. Tests swap in [`ManualClock`] to drive time deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

/// Time source used by every time-dependent component.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time in unix seconds.
    fn now(&self) -> f64;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real time backed by the system clock and the Tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when told to.
///
/// `sleep` advances the clock by the requested duration and yields, so code
/// that waits on the clock completes instantly in tests.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicU64,
    slept_micros: AtomicU64,
}

impl ManualClock {
    /// Start at `start` unix seconds.
    pub fn new(start: f64) -> Self {
        Self {
            micros: AtomicU64::new((start * 1_000_000.0) as u64),
            slept_micros: AtomicU64::new(0),
        }
    }

    /// Move time forward.
    pub fn advance(&self, duration: Duration) {
        self.micros
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    /// Total time spent in `sleep` so far.
    pub fn total_slept(&self) -> Duration {
        Duration::from_micros(self.slept_micros.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000.0)
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }

    async fn sleep(&self, duration: Duration) {
        self.slept_micros
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_sleep_advances_time() {
        let clock = ManualClock::new(100.0);
        clock.sleep(Duration::from_millis(1500)).await;
        assert!((clock.now() - 101.5).abs() < 1e-6);
        assert_eq!(clock.total_slept(), Duration::from_millis(1500));

        clock.advance(Duration::from_secs(2));
        assert!((clock.now() - 103.5).abs() < 1e-6);
    }

    #[test]
    fn test_system_clock_is_past_epoch() {
        assert!(SystemClock.now() > 1_600_000_000.0);
    }
}
