//! Queue processor.
//!
//! Polls the queue for due jobs, fans each one out to its endpoints and
//! writes the aggregated result back. Jobs in one batch run concurrently up
//! to `max_concurrent_jobs`; the queue is never held open during delivery.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::models::{QueueStatus, QueuedJobDbModel};
use crate::database::repositories::ScheduledJobRepository;
use crate::dispatch::{Aggregation, Dispatcher, Outcome, aggregate};
use crate::endpoint::{DeliveryEndpoint, EndpointRegistry};
use crate::error::DeliveryError;
use crate::metrics::{DeliveryRecord, MetricsRecorder, names};
use crate::notification::{BodyFormat, Notification};
use crate::queue::NotificationQueue;
use crate::scheduler::TEMPLATE_KEY;
use crate::template::TemplateEngine;

/// Metadata key selecting the body format (`text`, `html`, `markdown`).
pub const FORMAT_KEY: &str = "format";
/// Metadata key carrying a link back to the notification's origin.
pub const SOURCE_URL_KEY: &str = "source_url";

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Jobs leased per poll.
    pub batch_size: i64,
    pub max_concurrent_jobs: usize,
    /// Deadline for one job's fan-out.
    pub dispatch_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 10,
            max_concurrent_jobs: 4,
            dispatch_deadline: Duration::from_secs(60),
        }
    }
}

/// Leases due jobs and delivers them.
pub struct QueueProcessor {
    queue: NotificationQueue,
    registry: Arc<EndpointRegistry>,
    dispatcher: Dispatcher,
    templates: Arc<TemplateEngine>,
    metrics: MetricsRecorder,
    scheduled_jobs: Arc<dyn ScheduledJobRepository>,
    config: WorkerConfig,
    active_jobs: AtomicUsize,
}

impl QueueProcessor {
    pub fn new(
        queue: NotificationQueue,
        registry: Arc<EndpointRegistry>,
        dispatcher: Dispatcher,
        templates: Arc<TemplateEngine>,
        metrics: MetricsRecorder,
        scheduled_jobs: Arc<dyn ScheduledJobRepository>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            dispatcher,
            templates,
            metrics,
            scheduled_jobs,
            config,
            active_jobs: AtomicUsize::new(0),
        }
    }

    /// Poll until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "Queue processor started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Queue processor received cancellation signal");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once(&cancel).await {
                        error!(error = %e, "Queue poll failed");
                    }
                }
            }
        }

        info!("Queue processor stopped");
    }

    /// Lease one batch and process it to completion. Returns the batch size.
    pub async fn poll_once(self: &Arc<Self>, cancel: &CancellationToken) -> Result<usize> {
        let jobs = self.queue.lease_due(self.config.batch_size).await?;
        let leased = jobs.len();
        if leased > 0 {
            debug!(leased, "Leased due notifications");
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
        let mut tasks = JoinSet::new();

        for job in jobs {
            let this = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let id = job.id;
                if let Err(e) = this.process(job, &cancel).await {
                    error!(job_id = id, error = %e, "Failed to process queued notification");
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Queue worker task panicked");
            }
        }

        self.refresh_queue_gauges().await;
        Ok(leased)
    }

    /// Deliver one leased job and record its next state.
    pub async fn process(&self, job: QueuedJobDbModel, cancel: &CancellationToken) -> Result<QueuedJobDbModel> {
        let active = self.active_jobs.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.update_gauge(names::ACTIVE_JOBS, active as f64);

        let result = self.deliver(&job, cancel).await;

        let active = self.active_jobs.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.update_gauge(names::ACTIVE_JOBS, active as f64);

        let updated = result?;
        if let Some(scheduled_id) = updated.scheduled_id {
            if let Err(e) = self
                .scheduled_jobs
                .set_last_status(scheduled_id, &updated.status)
                .await
            {
                warn!(scheduled_id, error = %e, "Failed to update scheduled job status");
            }
        }
        Ok(updated)
    }

    async fn deliver(&self, job: &QueuedJobDbModel, cancel: &CancellationToken) -> Result<QueuedJobDbModel> {
        let notification = match self.build_notification(job).await {
            Ok(notification) => notification,
            Err(e) => {
                // Nothing was sent; configuration errors never retry.
                warn!(job_id = job.id, error = %e, "Notification could not be built");
                return self.queue.fail(job.id, e.to_string()).await;
            }
        };

        let urls = job.services()?;
        let mut resolved: Vec<(usize, Arc<dyn DeliveryEndpoint>)> = Vec::with_capacity(urls.len());
        let mut outcomes: Vec<Option<Outcome>> = vec![None; urls.len()];

        for (index, url) in urls.iter().enumerate() {
            match self.registry.resolve(url) {
                Ok(endpoint) => resolved.push((index, endpoint)),
                Err(e) => {
                    let service_id = self.registry.service_id_for(url).unwrap_or("unknown");
                    outcomes[index] = Some(Outcome::failed(
                        service_id,
                        DeliveryError::permanent(e.to_string()),
                        Duration::ZERO,
                    ));
                }
            }
        }

        let (indices, endpoints): (Vec<usize>, Vec<_>) = resolved.into_iter().unzip();
        let delivered = self
            .dispatcher
            .dispatch_with_cancel(
                Arc::new(notification),
                endpoints,
                self.config.dispatch_deadline,
                cancel,
            )
            .await;
        for (index, outcome) in indices.into_iter().zip(delivered) {
            outcomes[index] = Some(outcome);
        }
        let outcomes: Vec<Outcome> = outcomes.into_iter().flatten().collect();

        let metadata = job.metadata()?;
        for (url, outcome) in urls.iter().zip(&outcomes) {
            let record = DeliveryRecord {
                job_id: Some(job.id),
                scheduled_job_id: job.scheduled_id,
                service_url: url,
                notify_type: job.notify_type(),
                outcome,
                metadata: Some(&metadata),
            };
            if let Err(e) = self.metrics.record_delivery(&record).await {
                warn!(job_id = job.id, error = %e, "Failed to record delivery sample");
            }
        }

        let updated = match aggregate(&outcomes, job.retry_count, job.max_retries) {
            Aggregation::Completed { warning } => self.queue.complete(job.id, warning).await?,
            Aggregation::Retry { error } | Aggregation::Fail { error } => {
                self.queue.record_failure(job.id, error).await?
            }
        };

        debug!(
            job_id = job.id,
            status = %updated.status,
            endpoints = outcomes.len(),
            "Processed queued notification"
        );
        Ok(updated)
    }

    async fn build_notification(&self, job: &QueuedJobDbModel) -> Result<Notification> {
        let metadata = job.metadata()?;

        let (title, body) = match metadata.get(TEMPLATE_KEY) {
            Some(name) => {
                let rendered = self.templates.render(name, &metadata).await?;
                (rendered.title, rendered.body)
            }
            None => (job.title.clone(), job.body.clone()),
        };

        let mut notification = Notification::new(title, body)
            .with_type(job.notify_type())
            .with_tags(job.tags()?);
        if let Some(format) = metadata
            .get(FORMAT_KEY)
            .and_then(|f| BodyFormat::from_str(&f.to_ascii_lowercase()).ok())
        {
            notification = notification.with_format(format);
        }
        if let Some(source) = metadata.get(SOURCE_URL_KEY) {
            notification = notification.with_source_url(source.clone());
        }
        Ok(notification)
    }

    async fn refresh_queue_gauges(&self) {
        match self.queue.stats().await {
            Ok(stats) => {
                for status in QueueStatus::iter() {
                    self.metrics.update_gauge_with_labels(
                        names::QUEUE_DEPTH,
                        &[("status", status.as_str())],
                        stats.get(status) as f64,
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to read queue stats"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{Metadata, NewQueuedJob, NewScheduledJob};
    use crate::database::repositories::{
        MetricsRepository, SqlxMetricsRepository, SqlxQueueRepository,
        SqlxScheduledJobRepository, SqlxTemplateRepository,
    };
    use crate::database::test_pool;
    use crate::endpoint::{DeliveryResult, EndpointFactory, EndpointUrl, HttpClientPool};
    use crate::metrics::MetricsCollector;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    /// `mock://ok` succeeds, `mock://fail` fails transiently.
    struct MockEndpoint {
        succeed: bool,
        sends: Arc<AtomicU64>,
    }

    #[async_trait]
    impl DeliveryEndpoint for MockEndpoint {
        fn service_id(&self) -> &'static str {
            "mock"
        }

        async fn send(&self, _: &Notification, _: &CancellationToken) -> DeliveryResult {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(())
            } else {
                Err(DeliveryError::transient("503 Service Unavailable"))
            }
        }

        fn default_port(&self) -> u16 {
            0
        }
    }

    struct MockFactory {
        sends: Arc<AtomicU64>,
    }

    impl EndpointFactory for MockFactory {
        fn service_id(&self) -> &'static str {
            "mock"
        }

        fn schemes(&self) -> &'static [&'static str] {
            &["mock"]
        }

        fn parse(&self, url: &EndpointUrl, _: &HttpClientPool) -> Result<Arc<dyn DeliveryEndpoint>> {
            self.validate(url)?;
            Ok(Arc::new(MockEndpoint {
                succeed: url.host_port() == "ok",
                sends: self.sends.clone(),
            }))
        }

        fn validate(&self, url: &EndpointUrl) -> Result<()> {
            match url.host_port() {
                "ok" | "fail" => Ok(()),
                _ => Err(Error::invalid_url(url.as_str(), "expected ok or fail")),
            }
        }
    }

    struct Fixture {
        processor: Arc<QueueProcessor>,
        queue: NotificationQueue,
        metrics_repo: Arc<SqlxMetricsRepository>,
        scheduled: Arc<SqlxScheduledJobRepository>,
        collector: Arc<MetricsCollector>,
        sends: Arc<AtomicU64>,
    }

    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        let sends = Arc::new(AtomicU64::new(0));
        let registry = Arc::new(
            EndpointRegistry::builder()
                .register(Arc::new(MockFactory {
                    sends: sends.clone(),
                }))
                .build(Arc::new(HttpClientPool::new().unwrap())),
        );
        let queue = NotificationQueue::new(Arc::new(SqlxQueueRepository::new(pool.clone())));
        let templates = Arc::new(TemplateEngine::new(Arc::new(SqlxTemplateRepository::new(
            pool.clone(),
        ))));
        let metrics_repo = Arc::new(SqlxMetricsRepository::new(pool.clone()));
        let collector = Arc::new(MetricsCollector::new());
        let scheduled = Arc::new(SqlxScheduledJobRepository::new(pool));

        let processor = Arc::new(QueueProcessor::new(
            queue.clone(),
            registry,
            Dispatcher::default(),
            templates,
            MetricsRecorder::new(collector.clone(), metrics_repo.clone()),
            scheduled.clone(),
            WorkerConfig {
                dispatch_deadline: Duration::from_secs(5),
                ..Default::default()
            },
        ));

        Fixture {
            processor,
            queue,
            metrics_repo,
            scheduled,
            collector,
            sends,
        }
    }

    fn job(services: &[&str]) -> NewQueuedJob {
        NewQueuedJob::new("t", "b", services.iter().map(|s| s.to_string()).collect())
    }

    async fn run_once(f: &Fixture) {
        f.processor.poll_once(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_all_success_completes() {
        let f = fixture().await;
        let id = f.queue.enqueue(job(&["mock://ok", "mock://ok"])).await.unwrap().id;

        run_once(&f).await;

        let row = f.queue.get(id).await.unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.error_message, None);
        assert_eq!(f.sends.load(Ordering::SeqCst), 2);
        assert_eq!(f.collector.gauge(names::QUEUE_DEPTH, &[("status", "completed")]), Some(1.0));
        assert_eq!(f.collector.gauge(names::ACTIVE_JOBS, &[]), Some(0.0));
    }

    #[tokio::test]
    async fn test_partial_success_does_not_retry() {
        let f = fixture().await;
        let id = f.queue.enqueue(job(&["mock://ok", "mock://fail"])).await.unwrap().id;

        run_once(&f).await;

        let row = f.queue.get(id).await.unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.retry_count, 0);
        assert!(row.error_message.unwrap().contains("1/2"));

        let samples = f.metrics_repo.list_between(0, i64::MAX).await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples.iter().filter(|s| s.is_success()).count(), 1);

        // Nothing left to lease.
        assert_eq!(f.processor.poll_once(&CancellationToken::new()).await.unwrap(), 0);
        assert_eq!(f.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_all_fail_schedules_retry() {
        let f = fixture().await;
        let id = f.queue.enqueue(job(&["mock://fail"])).await.unwrap().id;

        run_once(&f).await;

        let row = f.queue.get(id).await.unwrap();
        assert_eq!(row.status, "retrying");
        assert_eq!(row.retry_count, 1);
        assert!(row.next_retry_at.unwrap() > crate::database::time::now_ms());
        assert!(row.error_message.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_exhausted_job_fails() {
        let f = fixture().await;
        let id = f
            .queue
            .enqueue(job(&["mock://fail"]).with_max_retries(0))
            .await
            .unwrap()
            .id;

        run_once(&f).await;
        assert_eq!(f.queue.get(id).await.unwrap().status, "failed");
    }

    #[tokio::test]
    async fn test_unresolvable_url_counts_as_failure() {
        let f = fixture().await;
        let id = f
            .queue
            .enqueue(job(&["mock://ok", "gopher://nope"]))
            .await
            .unwrap()
            .id;

        run_once(&f).await;

        let row = f.queue.get(id).await.unwrap();
        assert_eq!(row.status, "completed");
        assert!(row.error_message.unwrap().contains("gopher"));
    }

    #[tokio::test]
    async fn test_missing_template_fails_before_send() {
        let f = fixture().await;
        let mut metadata = Metadata::new();
        metadata.insert(TEMPLATE_KEY.to_string(), "missing".to_string());
        let id = f
            .queue
            .enqueue(job(&["mock://ok"]).with_metadata(metadata))
            .await
            .unwrap()
            .id;

        run_once(&f).await;

        let row = f.queue.get(id).await.unwrap();
        assert_eq!(row.status, "failed");
        assert!(row.error_message.unwrap().contains("missing"));
        assert_eq!(f.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_last_status_written_back() {
        let f = fixture().await;
        let scheduled = f
            .scheduled
            .create(&NewScheduledJob::new("j", "* * * * *", vec!["mock://ok".into()]), None, 0)
            .await
            .unwrap();
        f.queue
            .enqueue(job(&["mock://ok"]).with_scheduled_id(scheduled.id))
            .await
            .unwrap();

        run_once(&f).await;

        let scheduled = f.scheduled.get(scheduled.id).await.unwrap();
        assert_eq!(scheduled.last_status.as_deref(), Some("completed"));
    }
}
