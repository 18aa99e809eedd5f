//! Retries for writes that lose the SQLite write lock.
//!
//! WAL mode lets readers proceed, but concurrent writers (workers leasing,
//! the scheduler enqueueing, maintenance purging) can still see
//! `SQLITE_BUSY` once the busy timeout is spent. Those writes are retried
//! with capped exponential backoff plus up to 25% jitter.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tracing::debug;

use crate::Result;

/// Backoff schedule for busy retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 12,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BusyRetryPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let spread = delay.as_millis() as u64 / 4;
        let jitter = Duration::from_millis(random::<u64>() % (spread + 1));
        (delay + jitter).min(self.max_delay)
    }

    /// Run `op`, retrying while SQLite reports busy.
    pub async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if err.is_busy() && attempt < self.max_retries => {
                    let delay = self.jittered(attempt);
                    attempt += 1;
                    debug!(
                        op = op_name,
                        attempt,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "SQLite busy, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

/// [`BusyRetryPolicy::run`] with the default policy.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    BusyRetryPolicy::default().run(op_name, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn busy() -> Error {
        Error::DatabaseSqlx(sqlx::Error::Protocol("database is locked".into()))
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = BusyRetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(3), Duration::from_millis(80));
        assert_eq!(policy.delay(8), Duration::from_secs(2));
        assert_eq!(policy.delay(40), Duration::from_secs(2));
        for attempt in 0..12 {
            assert!(policy.jittered(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn test_busy_classification() {
        assert!(busy().is_busy());
        assert!(!Error::DatabaseSqlx(sqlx::Error::RowNotFound).is_busy());
        assert!(!Error::validation("database is locked").is_busy());
    }

    #[tokio::test]
    async fn test_busy_error_is_retried() {
        let policy = BusyRetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicUsize::new(0);
        let value = policy
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(busy()) } else { Ok(n) } }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let policy = BusyRetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let calls = AtomicUsize::new(0);
        let result: Result<()> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(busy()) }
            })
            .await;

        assert!(result.unwrap_err().is_busy());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_busy_error_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_on_sqlite_busy("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::validation("nope")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
