//! Scheduled job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::is_unique_violation;
use crate::database::models::{NewScheduledJob, ScheduledJobDbModel, ScheduledJobUpdate, encode};
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Scheduled job repository trait.
#[async_trait]
pub trait ScheduledJobRepository: Send + Sync {
    async fn create(
        &self,
        job: &NewScheduledJob,
        next_run: Option<i64>,
        now_ms: i64,
    ) -> Result<ScheduledJobDbModel>;
    async fn get(&self, id: i64) -> Result<ScheduledJobDbModel>;
    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduledJobDbModel>>;
    async fn list(&self) -> Result<Vec<ScheduledJobDbModel>>;
    async fn list_enabled(&self) -> Result<Vec<ScheduledJobDbModel>>;
    async fn update(
        &self,
        id: i64,
        update: &ScheduledJobUpdate,
        now_ms: i64,
    ) -> Result<ScheduledJobDbModel>;
    async fn delete(&self, id: i64) -> Result<()>;
    async fn set_next_run(&self, id: i64, next_run: Option<i64>) -> Result<()>;
    /// Record a tick: `last_run`, `next_run`, `run_count + 1`.
    async fn record_run(&self, id: i64, ran_at: i64, next_run: Option<i64>) -> Result<()>;
    async fn set_last_status(&self, id: i64, status: &str) -> Result<()>;
}

/// SQLx implementation of ScheduledJobRepository.
pub struct SqlxScheduledJobRepository {
    pool: SqlitePool,
}

impl SqlxScheduledJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduledJobRepository for SqlxScheduledJobRepository {
    async fn create(
        &self,
        job: &NewScheduledJob,
        next_run: Option<i64>,
        now_ms: i64,
    ) -> Result<ScheduledJobDbModel> {
        let services = encode(&job.services)?;
        let tags = encode(&job.tags)?;
        let metadata = encode(&job.metadata)?;

        let result = sqlx::query_as::<_, ScheduledJobDbModel>(
            r#"
            INSERT INTO scheduled_jobs (
                name, cron_expression, title, body, notify_type, services, tags, metadata,
                template, enabled, created_at, updated_at, next_run, run_count
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            RETURNING *
            "#,
        )
        .bind(&job.name)
        .bind(&job.cron_expression)
        .bind(&job.title)
        .bind(&job.body)
        .bind(job.notify_type.as_str())
        .bind(&services)
        .bind(&tags)
        .bind(&metadata)
        .bind(&job.template)
        .bind(job.enabled)
        .bind(now_ms)
        .bind(now_ms)
        .bind(next_run)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(e) if is_unique_violation(&e) => {
                Err(Error::already_exists("ScheduledJob", job.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: i64) -> Result<ScheduledJobDbModel> {
        sqlx::query_as::<_, ScheduledJobDbModel>("SELECT * FROM scheduled_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("ScheduledJob", id))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduledJobDbModel>> {
        let job =
            sqlx::query_as::<_, ScheduledJobDbModel>("SELECT * FROM scheduled_jobs WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(job)
    }

    async fn list(&self) -> Result<Vec<ScheduledJobDbModel>> {
        let jobs = sqlx::query_as::<_, ScheduledJobDbModel>(
            "SELECT * FROM scheduled_jobs ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_enabled(&self) -> Result<Vec<ScheduledJobDbModel>> {
        let jobs = sqlx::query_as::<_, ScheduledJobDbModel>(
            "SELECT * FROM scheduled_jobs WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn update(
        &self,
        id: i64,
        update: &ScheduledJobUpdate,
        now_ms: i64,
    ) -> Result<ScheduledJobDbModel> {
        let current = self.get(id).await?;

        let services = match &update.services {
            Some(services) => encode(services)?,
            None => current.services,
        };
        let tags = match &update.tags {
            Some(tags) => encode(tags)?,
            None => current.tags,
        };
        let metadata = match &update.metadata {
            Some(metadata) => encode(metadata)?,
            None => current.metadata,
        };
        let template = match &update.template {
            Some(template) => template.clone(),
            None => current.template,
        };
        let notify_type = update
            .notify_type
            .map(|t| t.as_str().to_string())
            .unwrap_or(current.notify_type);

        let row = sqlx::query_as::<_, ScheduledJobDbModel>(
            r#"
            UPDATE scheduled_jobs
            SET cron_expression = ?, title = ?, body = ?, notify_type = ?, services = ?,
                tags = ?, metadata = ?, template = ?, enabled = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(update.cron_expression.as_ref().unwrap_or(&current.cron_expression))
        .bind(update.title.as_ref().unwrap_or(&current.title))
        .bind(update.body.as_ref().unwrap_or(&current.body))
        .bind(&notify_type)
        .bind(&services)
        .bind(&tags)
        .bind(&metadata)
        .bind(&template)
        .bind(update.enabled.unwrap_or(current.enabled))
        .bind(now_ms)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("ScheduledJob", id))?;

        Ok(row)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("ScheduledJob", id));
        }
        Ok(())
    }

    async fn set_next_run(&self, id: i64, next_run: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE scheduled_jobs SET next_run = ? WHERE id = ?")
            .bind(next_run)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_run(&self, id: i64, ran_at: i64, next_run: Option<i64>) -> Result<()> {
        let pool = &self.pool;
        retry_on_sqlite_busy("scheduled_job_record_run", || async move {
            let result = sqlx::query(
                r#"
                UPDATE scheduled_jobs
                SET last_run = ?, next_run = ?, run_count = run_count + 1
                WHERE id = ?
                "#,
            )
            .bind(ran_at)
            .bind(next_run)
            .bind(id)
            .execute(pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(Error::not_found("ScheduledJob", id));
            }
            Ok(())
        })
        .await
    }

    async fn set_last_status(&self, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE scheduled_jobs SET last_status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
