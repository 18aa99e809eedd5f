//! Delivery metrics repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{MetricsSampleDbModel, NewMetricsSample};
use crate::database::retry::retry_on_sqlite_busy;
use crate::Result;

/// Metrics repository trait. Samples are append-only.
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn append(&self, sample: &NewMetricsSample) -> Result<i64>;
    /// Samples with `start_ms <= timestamp < end_ms`, oldest first.
    async fn list_between(&self, start_ms: i64, end_ms: i64) -> Result<Vec<MetricsSampleDbModel>>;
    async fn purge(&self, older_than_ms: i64) -> Result<u64>;
}

/// SQLx implementation of MetricsRepository.
pub struct SqlxMetricsRepository {
    pool: SqlitePool,
}

impl SqlxMetricsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricsRepository for SqlxMetricsRepository {
    async fn append(&self, sample: &NewMetricsSample) -> Result<i64> {
        let pool = &self.pool;
        retry_on_sqlite_busy("metrics_append", || async move {
            let result = sqlx::query(
                r#"
                INSERT INTO notification_metrics (
                    job_id, scheduled_job_id, service_id, service_url, notification_type,
                    status, duration_ms, error_message, metadata, timestamp
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(sample.job_id)
            .bind(sample.scheduled_job_id)
            .bind(&sample.service_id)
            .bind(&sample.service_url)
            .bind(&sample.notification_type)
            .bind(sample.status.as_str())
            .bind(sample.duration_ms)
            .bind(&sample.error_message)
            .bind(&sample.metadata)
            .bind(sample.timestamp)
            .execute(pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
        .await
    }

    async fn list_between(&self, start_ms: i64, end_ms: i64) -> Result<Vec<MetricsSampleDbModel>> {
        let samples = sqlx::query_as::<_, MetricsSampleDbModel>(
            r#"
            SELECT * FROM notification_metrics
            WHERE timestamp >= ? AND timestamp < ?
            ORDER BY timestamp, id
            "#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(samples)
    }

    async fn purge(&self, older_than_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM notification_metrics WHERE timestamp < ?")
            .bind(older_than_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
