//! Retry backoff.

use std::time::Duration;

/// Largest exponent applied to the base delay (2^6 = 64).
const MAX_EXPONENT: u32 = 6;

/// Delay before retry number `retry_count` (1-based).
///
/// Formula: `base * min(2^(retry_count - 1), 64)`. Never shorter than 1 ms so
/// that `next_retry_at` is always in the future.
pub fn retry_delay(base: Duration, retry_count: i64) -> Duration {
    let exponent = retry_count.saturating_sub(1).clamp(0, MAX_EXPONENT as i64) as u32;
    let multiplier = 2u32.saturating_pow(exponent);
    base.saturating_mul(multiplier).max(Duration::from_millis(1))
}

/// Millisecond form of [`retry_delay`], saturating at `i64::MAX`.
pub fn retry_delay_ms(base: Duration, retry_count: i64) -> i64 {
    i64::try_from(retry_delay(base, retry_count).as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_sequence() {
        let base = Duration::from_secs(60);
        let mins: Vec<u64> = (1..=5)
            .map(|r| retry_delay(base, r).as_secs() / 60)
            .collect();
        assert_eq!(mins, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_capped_at_64x() {
        let base = Duration::from_secs(1);
        assert_eq!(retry_delay(base, 7), Duration::from_secs(64));
        assert_eq!(retry_delay(base, 8), Duration::from_secs(64));
        assert_eq!(retry_delay(base, 1_000), Duration::from_secs(64));
    }

    #[test]
    fn test_floor() {
        assert_eq!(retry_delay(Duration::ZERO, 1), Duration::from_millis(1));
        assert_eq!(retry_delay(Duration::from_secs(5), 0), Duration::from_secs(5));
        assert_eq!(retry_delay_ms(Duration::MAX, 3), i64::MAX);
    }
}
