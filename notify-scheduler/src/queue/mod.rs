//! Durable notification queue.
//!
//! [`NotificationQueue`] owns every write to `notification_queue`. Rows move
//! through `pending -> running -> {completed, retrying, failed}` and
//! `retrying -> running`; every transition is a single optimistic
//! `UPDATE ... WHERE status = ?` so concurrent writers cannot double-apply.

mod backoff;

pub use backoff::{retry_delay, retry_delay_ms};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::database::models::{
    NewQueuedJob, QueueStats, QueueStatus, QueueTransition, QueuedJobDbModel,
};
use crate::database::repositories::QueueRepository;
use crate::database::time::now_ms;
use crate::endpoint::EndpointRegistry;
use crate::{Error, Result};

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Service over the queue repository.
#[derive(Clone)]
pub struct NotificationQueue {
    repo: Arc<dyn QueueRepository>,
    registry: Option<Arc<EndpointRegistry>>,
}

impl NotificationQueue {
    pub fn new(repo: Arc<dyn QueueRepository>) -> Self {
        Self {
            repo,
            registry: None,
        }
    }

    /// Validate service URLs through `registry` on enqueue.
    pub fn with_registry(mut self, registry: Arc<EndpointRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn enqueue(&self, job: NewQueuedJob) -> Result<QueuedJobDbModel> {
        self.enqueue_at(job, now_ms()).await
    }

    pub async fn enqueue_at(&self, job: NewQueuedJob, now: i64) -> Result<QueuedJobDbModel> {
        self.check(&job)?;
        let row = self.repo.insert(&job, now).await?;
        debug!(
            job_id = row.id,
            priority = row.priority,
            services = job.services.len(),
            "Enqueued notification"
        );
        Ok(row)
    }

    fn check(&self, job: &NewQueuedJob) -> Result<()> {
        if job.services.is_empty() {
            return Err(Error::validation("at least one service URL is required"));
        }
        if job.max_retries < 0 {
            return Err(Error::validation("max_retries must not be negative"));
        }
        if let Some(registry) = &self.registry {
            for url in &job.services {
                registry.validate(url)?;
            }
        }
        Ok(())
    }

    /// Lease up to `limit` due jobs, flipping them to `running`.
    pub async fn lease_due(&self, limit: i64) -> Result<Vec<QueuedJobDbModel>> {
        self.lease_due_at(now_ms(), limit).await
    }

    pub async fn lease_due_at(&self, now: i64, limit: i64) -> Result<Vec<QueuedJobDbModel>> {
        self.repo.lease_due(now, limit).await
    }

    /// Apply a state change with its side effects.
    pub async fn transition(
        &self,
        id: i64,
        to: QueueStatus,
        error: Option<String>,
    ) -> Result<QueuedJobDbModel> {
        self.transition_at(id, to, error, now_ms()).await
    }

    pub async fn transition_at(
        &self,
        id: i64,
        to: QueueStatus,
        error: Option<String>,
        now: i64,
    ) -> Result<QueuedJobDbModel> {
        let job = self.repo.get(id).await?;
        let from = job.status()?;

        if !from.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let transition = match to {
            QueueStatus::Running => QueueTransition {
                from,
                to,
                retry_count: job.retry_count,
                error_message: job.error_message.clone(),
                started_at: Some(now),
                completed_at: None,
                next_retry_at: None,
            },
            QueueStatus::Completed => QueueTransition {
                from,
                to,
                retry_count: job.retry_count,
                error_message: error,
                started_at: job.started_at,
                completed_at: Some(now),
                next_retry_at: None,
            },
            QueueStatus::Retrying => {
                if !job.attempts_left() {
                    return Err(Error::validation(format!(
                        "queued job {} has no attempts left ({}/{})",
                        id, job.retry_count, job.max_retries
                    )));
                }
                let retry_count = job.retry_count + 1;
                let delay = retry_delay_ms(job.retry_delay(), retry_count);
                QueueTransition {
                    from,
                    to,
                    retry_count,
                    error_message: error,
                    started_at: job.started_at,
                    completed_at: None,
                    next_retry_at: Some(now.saturating_add(delay)),
                }
            }
            QueueStatus::Failed => QueueTransition {
                from,
                to,
                retry_count: job.retry_count,
                error_message: error,
                started_at: job.started_at,
                completed_at: Some(now),
                next_retry_at: None,
            },
            QueueStatus::Pending => {
                return Err(Error::InvalidStateTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        };

        match self.repo.apply_transition(id, &transition).await? {
            Some(updated) => {
                debug!(job_id = id, from = %from, to = %to, "Queue transition");
                Ok(updated)
            }
            None => {
                // Lost a race with another writer.
                let current = self.repo.get(id).await?;
                Err(Error::InvalidStateTransition {
                    from: current.status,
                    to: to.to_string(),
                })
            }
        }
    }

    /// `running -> completed`. A partial delivery passes its warning here.
    pub async fn complete(&self, id: i64, warning: Option<String>) -> Result<QueuedJobDbModel> {
        if let Some(warning) = &warning {
            warn!(job_id = id, warning = %warning, "Completed with partial delivery");
        }
        self.transition(id, QueueStatus::Completed, warning).await
    }

    /// `running -> retrying` while attempts remain, otherwise `running -> failed`.
    pub async fn record_failure(&self, id: i64, error: impl Into<String>) -> Result<QueuedJobDbModel> {
        self.record_failure_at(id, error, now_ms()).await
    }

    pub async fn record_failure_at(
        &self,
        id: i64,
        error: impl Into<String>,
        now: i64,
    ) -> Result<QueuedJobDbModel> {
        let job = self.repo.get(id).await?;
        let to = if job.attempts_left() {
            QueueStatus::Retrying
        } else {
            QueueStatus::Failed
        };
        let updated = self.transition_at(id, to, Some(error.into()), now).await?;
        if to == QueueStatus::Failed {
            warn!(
                job_id = id,
                attempts = updated.retry_count + 1,
                "Notification failed permanently"
            );
        }
        Ok(updated)
    }

    /// `running -> failed` regardless of attempts left.
    pub async fn fail(&self, id: i64, error: impl Into<String>) -> Result<QueuedJobDbModel> {
        self.transition(id, QueueStatus::Failed, Some(error.into())).await
    }

    pub async fn get(&self, id: i64) -> Result<QueuedJobDbModel> {
        self.repo.get(id).await
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.repo.delete(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.repo.count_by_status().await
    }

    pub async fn list(&self, status: Option<QueueStatus>, limit: i64) -> Result<Vec<QueuedJobDbModel>> {
        self.repo.list(status, limit).await
    }

    /// Delete terminal rows finished more than `older_than` ago.
    pub async fn purge(&self, older_than: Duration) -> Result<u64> {
        let cutoff = now_ms().saturating_sub(duration_ms(older_than));
        let removed = self.repo.purge(cutoff).await?;
        if removed > 0 {
            info!(removed, "Purged finished queue entries");
        }
        Ok(removed)
    }

    /// Return `running` rows leased longer than `lease_timeout` ago to `pending`.
    pub async fn requeue_stale(&self, lease_timeout: Duration) -> Result<u64> {
        let cutoff = now_ms().saturating_sub(duration_ms(lease_timeout));
        let requeued = self.repo.requeue_stale(cutoff).await?;
        if requeued > 0 {
            warn!(requeued, "Requeued stale running jobs");
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxQueueRepository;
    use crate::database::test_pool;

    async fn queue() -> NotificationQueue {
        let pool = test_pool().await;
        NotificationQueue::new(Arc::new(SqlxQueueRepository::new(pool)))
    }

    fn job() -> NewQueuedJob {
        NewQueuedJob::new("t", "b", vec!["json://localhost/hook".to_string()])
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let queue = queue().await;
        let row = queue.enqueue_at(job(), 1_000).await.unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.priority, 1);
        assert_eq!(row.max_retries, 3);
        assert_eq!(row.retry_delay(), Duration::from_secs(300));
        assert_eq!(row.created_at, 1_000);
        assert_eq!(row.scheduled_at, 1_000);
    }

    #[tokio::test]
    async fn test_enqueue_requires_services() {
        let queue = queue().await;
        let err = queue
            .enqueue(NewQueuedJob::new("t", "b", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_backoff_then_fail() {
        let queue = queue().await;
        let id = queue
            .enqueue_at(
                job().with_max_retries(5).with_retry_delay(Duration::from_secs(60)),
                0,
            )
            .await
            .unwrap()
            .id;

        let mut now = 0;
        let mut delays = Vec::new();
        for _ in 0..5 {
            let leased = queue.lease_due_at(now, 10).await.unwrap();
            assert_eq!(leased.len(), 1);
            let row = queue.record_failure_at(id, "boom", now).await.unwrap();
            assert_eq!(row.status, "retrying");
            let next = row.next_retry_at.unwrap();
            delays.push((next - now) / 60_000);

            // Not visible before the retry is due.
            assert!(queue.lease_due_at(next - 1, 10).await.unwrap().is_empty());
            now = next;
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);

        queue.lease_due_at(now, 10).await.unwrap();
        let row = queue.record_failure_at(id, "boom", now).await.unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.retry_count, 5);
        assert_eq!(row.completed_at, Some(now));
        assert_eq!(row.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_illegal_transitions() {
        let queue = queue().await;
        let id = queue.enqueue(job()).await.unwrap().id;

        let err = queue
            .transition(id, QueueStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        queue.transition(id, QueueStatus::Running, None).await.unwrap();
        queue.complete(id, None).await.unwrap();

        let err = queue
            .transition(id, QueueStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_retrying_without_attempts_is_rejected() {
        let queue = queue().await;
        let id = queue.enqueue(job().with_max_retries(0)).await.unwrap().id;
        queue.lease_due(10).await.unwrap();

        let err = queue
            .transition(id, QueueStatus::Retrying, Some("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(queue.record_failure(id, "x").await.unwrap().status, "failed");
    }

    #[tokio::test]
    async fn test_partial_warning_is_kept() {
        let queue = queue().await;
        let id = queue.enqueue(job()).await.unwrap().id;
        queue.lease_due(10).await.unwrap();
        let row = queue
            .complete(id, Some("partial delivery".to_string()))
            .await
            .unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.error_message.as_deref(), Some("partial delivery"));
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_stats_and_purge() {
        let queue = queue().await;
        let done = queue.enqueue(job()).await.unwrap().id;
        queue.enqueue(job()).await.unwrap();
        queue.transition(done, QueueStatus::Running, None).await.unwrap();
        queue.complete(done, None).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);

        // Nothing is older than an hour yet.
        assert_eq!(queue.purge(Duration::from_secs(3600)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.purge(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_requeue_stale() {
        let queue = queue().await;
        let id = queue.enqueue(job()).await.unwrap().id;
        queue.lease_due_at(now_ms() - 60_000, 10).await.unwrap();

        assert_eq!(queue.requeue_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.requeue_stale(Duration::from_secs(30)).await.unwrap(), 1);
        assert_eq!(queue.get(id).await.unwrap().status, "pending");
    }
}
