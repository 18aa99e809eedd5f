//! Periodic database maintenance.
//!
//! - Retention cleanup of terminal queue rows
//! - Retention cleanup of delivery samples
//! - Recovery of jobs stuck in `running` after a crash

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::MetricsRecorder;
use crate::queue::NotificationQueue;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between maintenance runs (default: 1 hour).
    pub interval: Duration,
    /// Completed and failed jobs older than this are deleted (default: 30 days).
    pub queue_retention: Duration,
    /// Delivery samples older than this are deleted (default: 30 days).
    pub metrics_retention: Duration,
    /// `running` jobs started longer ago than this are requeued (default: 15 minutes).
    pub lease_timeout: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            queue_retention: DAY * 30,
            metrics_retention: DAY * 30,
            lease_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Counts from one maintenance run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub jobs_purged: u64,
    pub samples_purged: u64,
    pub jobs_requeued: u64,
}

/// Database maintenance scheduler.
pub struct MaintenanceScheduler {
    queue: NotificationQueue,
    metrics: MetricsRecorder,
    config: MaintenanceConfig,
    running: AtomicBool,
}

impl MaintenanceScheduler {
    pub fn new(queue: NotificationQueue, metrics: MetricsRecorder, config: MaintenanceConfig) -> Self {
        Self {
            queue,
            metrics,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Start the maintenance loop. It exits when `cancel` fires or [`stop`](Self::stop) is called.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.running.store(true, Ordering::SeqCst);
            self.run_loop(cancel).await;
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.is_running() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_maintenance().await {
                        error!(error = %e, "Maintenance error");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!("Maintenance scheduler stopped");
    }

    /// Run all maintenance tasks once.
    pub async fn run_maintenance(&self) -> crate::Result<MaintenanceReport> {
        debug!("Starting database maintenance");

        let report = MaintenanceReport {
            jobs_requeued: self.queue.requeue_stale(self.config.lease_timeout).await?,
            jobs_purged: self.queue.purge(self.config.queue_retention).await?,
            samples_purged: self.metrics.purge(self.config.metrics_retention).await?,
        };

        if report != MaintenanceReport::default() {
            info!(
                jobs_purged = report.jobs_purged,
                samples_purged = report.samples_purged,
                jobs_requeued = report.jobs_requeued,
                "Database maintenance completed"
            );
        }
        Ok(report)
    }
}
