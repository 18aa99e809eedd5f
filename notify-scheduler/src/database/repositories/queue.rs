//! Notification queue repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    NewQueuedJob, QueueStats, QueueStatus, QueueTransition, QueuedJobDbModel, encode,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::duration_to_ns;
use crate::{Error, Result};

/// Queue repository trait.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn insert(&self, job: &NewQueuedJob, now_ms: i64) -> Result<QueuedJobDbModel>;
    async fn get(&self, id: i64) -> Result<QueuedJobDbModel>;
    /// Atomically move up to `limit` due jobs to `running` and return them.
    async fn lease_due(&self, now_ms: i64, limit: i64) -> Result<Vec<QueuedJobDbModel>>;
    /// Apply `transition` if the row is still in `transition.from`.
    ///
    /// Returns `None` when the row exists but its status changed underneath.
    async fn apply_transition(
        &self,
        id: i64,
        transition: &QueueTransition,
    ) -> Result<Option<QueuedJobDbModel>>;
    async fn delete(&self, id: i64) -> Result<()>;
    async fn count_by_status(&self) -> Result<QueueStats>;
    async fn list(&self, status: Option<QueueStatus>, limit: i64) -> Result<Vec<QueuedJobDbModel>>;
    /// Delete terminal rows completed before `older_than_ms`.
    async fn purge(&self, older_than_ms: i64) -> Result<u64>;
    /// Return `running` rows leased before `started_before_ms` to `pending`.
    async fn requeue_stale(&self, started_before_ms: i64) -> Result<u64>;
}

/// SQLx implementation of QueueRepository.
pub struct SqlxQueueRepository {
    pool: SqlitePool,
}

impl SqlxQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Orders rows the way `lease_due` promises; `RETURNING` order is unspecified.
fn sort_by_lease_order(jobs: &mut [QueuedJobDbModel]) {
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

#[async_trait]
impl QueueRepository for SqlxQueueRepository {
    async fn insert(&self, job: &NewQueuedJob, now_ms: i64) -> Result<QueuedJobDbModel> {
        let services = encode(&job.services)?;
        let tags = encode(&job.tags)?;
        let metadata = encode(&job.metadata)?;
        let retry_delay_ns = duration_to_ns(job.retry_delay);

        let pool = &self.pool;
        let (services, tags, metadata) = (&services, &tags, &metadata);
        retry_on_sqlite_busy("queue_insert", || async move {
            let row = sqlx::query_as::<_, QueuedJobDbModel>(
                r#"
                INSERT INTO notification_queue (
                    scheduled_id, title, body, notify_type, services, tags, metadata,
                    priority, max_retries, retry_count, retry_delay_ns, status,
                    created_at, scheduled_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, 'pending', ?, ?)
                RETURNING *
                "#,
            )
            .bind(job.scheduled_id)
            .bind(&job.title)
            .bind(&job.body)
            .bind(job.notify_type.as_str())
            .bind(services)
            .bind(tags)
            .bind(metadata)
            .bind(job.priority)
            .bind(job.max_retries)
            .bind(retry_delay_ns)
            .bind(now_ms)
            .bind(now_ms)
            .fetch_one(pool)
            .await?;
            Ok(row)
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<QueuedJobDbModel> {
        sqlx::query_as::<_, QueuedJobDbModel>("SELECT * FROM notification_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("QueuedJob", id))
    }

    async fn lease_due(&self, now_ms: i64, limit: i64) -> Result<Vec<QueuedJobDbModel>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let pool = &self.pool;
        // A single UPDATE runs under SQLite's write lock, so a row can only
        // flip to 'running' once even with concurrent callers.
        let mut jobs = retry_on_sqlite_busy("queue_lease_due", || async move {
            let rows = sqlx::query_as::<_, QueuedJobDbModel>(
                r#"
                UPDATE notification_queue
                SET status = 'running', started_at = ?, next_retry_at = NULL
                WHERE id IN (
                    SELECT id FROM notification_queue
                    WHERE status IN ('pending', 'retrying')
                      AND (next_retry_at IS NULL OR next_retry_at <= ?)
                    ORDER BY priority DESC, created_at ASC, id ASC
                    LIMIT ?
                )
                AND status IN ('pending', 'retrying')
                RETURNING *
                "#,
            )
            .bind(now_ms)
            .bind(now_ms)
            .bind(limit)
            .fetch_all(pool)
            .await?;
            Ok(rows)
        })
        .await?;

        sort_by_lease_order(&mut jobs);
        Ok(jobs)
    }

    async fn apply_transition(
        &self,
        id: i64,
        transition: &QueueTransition,
    ) -> Result<Option<QueuedJobDbModel>> {
        let pool = &self.pool;
        retry_on_sqlite_busy("queue_transition", || async move {
            let row = sqlx::query_as::<_, QueuedJobDbModel>(
                r#"
                UPDATE notification_queue
                SET status = ?, retry_count = ?, error_message = ?,
                    started_at = ?, completed_at = ?, next_retry_at = ?
                WHERE id = ? AND status = ?
                RETURNING *
                "#,
            )
            .bind(transition.to.as_str())
            .bind(transition.retry_count)
            .bind(&transition.error_message)
            .bind(transition.started_at)
            .bind(transition.completed_at)
            .bind(transition.next_retry_at)
            .bind(id)
            .bind(transition.from.as_str())
            .fetch_optional(pool)
            .await?;
            Ok(row)
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM notification_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("QueuedJob", id));
        }
        Ok(())
    }

    async fn count_by_status(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM notification_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            if let Ok(status) = status.parse::<QueueStatus>() {
                stats.set(status, count.max(0) as u64);
            }
        }
        Ok(stats)
    }

    async fn list(&self, status: Option<QueueStatus>, limit: i64) -> Result<Vec<QueuedJobDbModel>> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, QueuedJobDbModel>(
                    "SELECT * FROM notification_queue WHERE status = ? ORDER BY priority DESC, created_at ASC, id ASC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, QueuedJobDbModel>(
                    "SELECT * FROM notification_queue ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(jobs)
    }

    async fn purge(&self, older_than_ms: i64) -> Result<u64> {
        let pool = &self.pool;
        retry_on_sqlite_busy("queue_purge", || async move {
            let result = sqlx::query(
                r#"
                DELETE FROM notification_queue
                WHERE status IN ('completed', 'failed') AND completed_at < ?
                "#,
            )
            .bind(older_than_ms)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn requeue_stale(&self, started_before_ms: i64) -> Result<u64> {
        let pool = &self.pool;
        retry_on_sqlite_busy("queue_requeue_stale", || async move {
            let result = sqlx::query(
                r#"
                UPDATE notification_queue
                SET status = 'pending', started_at = NULL
                WHERE status = 'running' AND started_at < ?
                "#,
            )
            .bind(started_before_ms)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
