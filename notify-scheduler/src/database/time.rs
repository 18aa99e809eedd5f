//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC), and
//! durations as `INTEGER` nanoseconds.

use std::time::Duration;

use chrono::{DateTime, Utc};

#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Epoch milliseconds back to a `DateTime<Utc>`, clamped to chrono's range.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(if ms < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Convert a duration to stored nanoseconds, saturating at `i64::MAX`.
#[inline]
pub fn duration_to_ns(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Convert stored nanoseconds to a duration. Negative values become zero.
#[inline]
pub fn ns_to_duration(ns: i64) -> Duration {
    Duration::from_nanos(u64::try_from(ns).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_round_trip() {
        let now = Utc::now();
        let ms = datetime_to_ms(now);
        assert_eq!(ms_to_datetime(ms).timestamp_millis(), ms);
        assert_eq!(ms_to_datetime(i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(ms_to_datetime(i64::MIN), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_duration_ns() {
        let five_min = Duration::from_secs(300);
        assert_eq!(duration_to_ns(five_min), 300_000_000_000);
        assert_eq!(ns_to_duration(300_000_000_000), five_min);
        assert_eq!(ns_to_duration(-5), Duration::ZERO);
    }
}
