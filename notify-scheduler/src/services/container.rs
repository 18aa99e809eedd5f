//! Service container for dependency injection.
//!
//! The ServiceContainer builds every service on one connection pool and
//! manages the lifecycle of the background loops.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::AppConfig;
use crate::database::MaintenanceScheduler;
use crate::database::repositories::{
    SqlxMetricsRepository, SqlxQueueRepository, SqlxScheduledJobRepository,
    SqlxTemplateRepository,
};
use crate::dispatch::Dispatcher;
use crate::endpoint::{EndpointRegistry, HttpClientPool};
use crate::metrics::{MetricsCollector, MetricsRecorder, PrometheusExporter};
use crate::queue::NotificationQueue;
use crate::scheduler::Scheduler;
use crate::template::TemplateEngine;
use crate::worker::QueueProcessor;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all application services.
pub struct ServiceContainer {
    pub pool: SqlitePool,
    pub registry: Arc<EndpointRegistry>,
    pub queue: NotificationQueue,
    pub templates: Arc<TemplateEngine>,
    pub scheduler: Arc<Scheduler>,
    pub metrics: MetricsRecorder,
    pub worker: Arc<QueueProcessor>,
    pub maintenance: Arc<MaintenanceScheduler>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Wire all services with default configuration.
    pub fn new(pool: SqlitePool) -> Result<Self> {
        Self::with_config(pool, &AppConfig::default())
    }

    /// Wire all services from `config`. Nothing is started.
    pub fn with_config(pool: SqlitePool, config: &AppConfig) -> Result<Self> {
        info!("Initializing service container");

        let queue_repo = Arc::new(SqlxQueueRepository::new(pool.clone()));
        let job_repo = Arc::new(SqlxScheduledJobRepository::new(pool.clone()));
        let template_repo = Arc::new(SqlxTemplateRepository::new(pool.clone()));
        let metrics_repo = Arc::new(SqlxMetricsRepository::new(pool.clone()));

        let metrics = MetricsRecorder::new(Arc::new(MetricsCollector::new()), metrics_repo);

        let clients = HttpClientPool::new()?.with_observer(Arc::new(metrics.clone()));
        let registry = Arc::new(
            EndpointRegistry::builder()
                .with_builtin()
                .build(Arc::new(clients)),
        );

        let queue = NotificationQueue::new(queue_repo).with_registry(registry.clone());
        let templates = Arc::new(TemplateEngine::new(template_repo));

        let scheduler = Arc::new(
            Scheduler::new(
                job_repo.clone(),
                queue.clone(),
                templates.clone(),
                config.scheduler.clone(),
            )
            .with_registry(registry.clone()),
        );

        let worker = Arc::new(QueueProcessor::new(
            queue.clone(),
            registry.clone(),
            Dispatcher::new(config.dispatcher.clone()),
            templates.clone(),
            metrics.clone(),
            job_repo,
            config.worker.clone(),
        ));

        let maintenance = Arc::new(MaintenanceScheduler::new(
            queue.clone(),
            metrics.clone(),
            config.maintenance.clone(),
        ));

        Ok(Self {
            pool,
            registry,
            queue,
            templates,
            scheduler,
            metrics,
            worker,
            maintenance,
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Load scheduled jobs and start the scheduler, worker and maintenance loops.
    pub async fn start(&self) -> Result<()> {
        let loaded = self.scheduler.load().await?;
        info!(jobs = loaded, "Loaded scheduled jobs");

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.scheduler.clone().run(self.cancellation_token.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.worker.clone().run(self.cancellation_token.child_token()),
        ));
        tasks.push(
            self.maintenance
                .clone()
                .start(self.cancellation_token.child_token()),
        );

        info!("Services started");
        Ok(())
    }

    /// Prometheus text exposition of the current in-memory metrics.
    pub fn export_metrics(&self) -> String {
        PrometheusExporter::new(self.metrics.collector().clone()).export()
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    ///
    /// In-flight deliveries observe the cancellation and finish as
    /// cancelled attempts, so their jobs are retried on the next start.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        self.cancellation_token.cancel();
        self.maintenance.stop();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let shutdown_result = tokio::time::timeout(timeout, async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        })
        .await;

        if shutdown_result.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Closing database pool...");
        self.pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{NewQueuedJob, NewScheduledJob};
    use crate::database::test_pool;

    #[tokio::test]
    async fn test_container_wires_registry_validation() {
        let container = ServiceContainer::new(test_pool().await).unwrap();

        let err = container
            .queue
            .enqueue(NewQueuedJob::new("t", "b", vec!["gopher://x".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::UnknownScheme(_)));

        let err = container
            .scheduler
            .add(NewScheduledJob::new("bad", "* * * * *", vec!["discord://only-id".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidEndpointUrl { .. }));
    }

    #[tokio::test]
    async fn test_export_metrics() {
        let container = ServiceContainer::new(test_pool().await).unwrap();
        container.metrics.update_gauge(crate::metrics::names::ACTIVE_JOBS, 2.0);

        let text = container.export_metrics();
        assert!(text.contains("# TYPE notify_scheduler_active_jobs gauge"));
        assert!(text.contains("notify_scheduler_active_jobs 2"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let container = ServiceContainer::new(test_pool().await).unwrap();
        container
            .scheduler
            .add(NewScheduledJob::new(
                "hourly",
                "@hourly",
                vec!["json://localhost/hook".into()],
            ))
            .await
            .unwrap();

        container.start().await.unwrap();
        assert!(!container.is_shutting_down());
        assert_eq!(container.scheduler.registered(), 1);

        container
            .shutdown_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(container.is_shutting_down());
        assert!(container.pool.is_closed());
    }
}
