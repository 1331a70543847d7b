//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Calculate exponential backoff delay with jitter.
///
/// The delay is `base * 2^(attempt-1)` capped at `max_ms`, plus a uniform
/// jitter in `0..=jitter_ms`.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64, jitter_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_ms)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, 100, 2000, 0);
        assert_eq!(b1.as_millis(), 100);

        let b2 = calculate_backoff(2, 100, 2000, 0);
        assert_eq!(b2.as_millis(), 200);

        let max = calculate_backoff(10, 100, 1000, 0);
        assert_eq!(max.as_millis(), 1000);
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..50 {
            let delay = calculate_backoff(3, 100, 30_000, 250).as_millis();
            assert!((400..=650).contains(&delay));
        }
        assert_eq!(calculate_backoff(0, 100, 1000, 250), Duration::ZERO);
    }

    #[test]
    fn test_large_attempts_saturate() {
        assert_eq!(calculate_backoff(200, 500, 30_000, 0).as_millis(), 30_000);
    }
}
