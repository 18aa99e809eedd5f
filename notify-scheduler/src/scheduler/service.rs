//! Cron scheduler service.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cron::CronSchedule;
use crate::database::models::{
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, NewQueuedJob, NewScheduledJob, QueuedJobDbModel,
    ScheduledJobDbModel, ScheduledJobUpdate,
};
use crate::database::repositories::ScheduledJobRepository;
use crate::database::time::{datetime_to_ms, now_ms};
use crate::endpoint::EndpointRegistry;
use crate::queue::NotificationQueue;
use crate::template::TemplateEngine;
use crate::{Error, Result};

/// Metadata key carrying the queued job's priority.
pub const PRIORITY_KEY: &str = "priority";
/// Metadata key carrying the queued job's retry budget.
pub const MAX_RETRIES_KEY: &str = "max_retries";
/// Metadata key naming a template the worker must render before sending.
pub const TEMPLATE_KEY: &str = "template";
/// Metadata key naming the scheduled job that produced a queued job.
pub const JOB_NAME_KEY: &str = "scheduled_job";

/// Sentinel for "no further occurrence".
const NEVER: i64 = i64::MAX;

/// Longest the ticker sleeps without re-checking.
const MAX_IDLE: Duration = Duration::from_secs(60);

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Timezone cron expressions are evaluated in.
    pub timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { timezone: Tz::UTC }
    }
}

struct RegisteredJob {
    schedule: CronSchedule,
    next_run_ms: AtomicI64,
}

/// Fires enabled scheduled jobs into the queue on their cron schedule.
///
/// Registered schedules live in memory behind a reader/writer lock; ticks
/// only take the read lock. CRUD writes go to the database first, then
/// re-register under the write lock.
pub struct Scheduler {
    repo: Arc<dyn ScheduledJobRepository>,
    queue: NotificationQueue,
    templates: Arc<TemplateEngine>,
    registry: Option<Arc<EndpointRegistry>>,
    config: SchedulerConfig,
    jobs: RwLock<HashMap<i64, RegisteredJob>>,
    wake: Notify,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn ScheduledJobRepository>,
        queue: NotificationQueue,
        templates: Arc<TemplateEngine>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            queue,
            templates,
            registry: None,
            config,
            jobs: RwLock::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    /// Validate service URLs through `registry` when jobs are added or updated.
    pub fn with_registry(mut self, registry: Arc<EndpointRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn next_after(&self, schedule: &CronSchedule, now: DateTime<Utc>) -> Option<i64> {
        schedule
            .next_after(now, self.config.timezone)
            .map(datetime_to_ms)
    }

    fn register(&self, id: i64, schedule: CronSchedule, next_run: Option<i64>) {
        self.jobs.write().insert(
            id,
            RegisteredJob {
                schedule,
                next_run_ms: AtomicI64::new(next_run.unwrap_or(NEVER)),
            },
        );
        self.wake.notify_one();
    }

    fn unregister(&self, id: i64) -> bool {
        let removed = self.jobs.write().remove(&id).is_some();
        if removed {
            self.wake.notify_one();
        }
        removed
    }

    fn check_services(&self, services: &[String]) -> Result<()> {
        if services.is_empty() {
            return Err(Error::validation("at least one service URL is required"));
        }
        if let Some(registry) = &self.registry {
            for url in services {
                registry.validate(url)?;
            }
        }
        Ok(())
    }

    /// Register every enabled job. Missed occurrences are not replayed.
    pub async fn load(&self) -> Result<usize> {
        self.load_at(Utc::now()).await
    }

    /// Register every enabled job with its next occurrence after `now`.
    /// Occurrences missed while offline are skipped.
    pub async fn load_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let jobs = self.repo.list_enabled().await?;
        let mut loaded = 0;

        for job in jobs {
            let schedule = match CronSchedule::parse(&job.cron_expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(job = %job.name, error = %e, "Skipping scheduled job with invalid cron expression");
                    continue;
                }
            };
            let next_run = self.next_after(&schedule, now);
            self.repo.set_next_run(job.id, next_run).await?;
            self.register(job.id, schedule, next_run);
            loaded += 1;
        }

        info!(loaded, "Scheduled jobs loaded");
        Ok(loaded)
    }

    pub async fn add(&self, job: NewScheduledJob) -> Result<ScheduledJobDbModel> {
        self.add_at(job, Utc::now()).await
    }

    pub async fn add_at(&self, job: NewScheduledJob, now: DateTime<Utc>) -> Result<ScheduledJobDbModel> {
        if job.name.trim().is_empty() {
            return Err(Error::validation("scheduled job name must not be empty"));
        }
        let schedule = CronSchedule::parse(&job.cron_expression)?;
        self.check_services(&job.services)?;
        if let Some(template) = &job.template {
            self.templates.get(template).await?;
        }

        let next_run = if job.enabled {
            self.next_after(&schedule, now)
        } else {
            None
        };
        let row = self.repo.create(&job, next_run, datetime_to_ms(now)).await?;
        if row.enabled {
            self.register(row.id, schedule, next_run);
        }

        info!(job = %row.name, id = row.id, cron = %row.cron_expression, "Scheduled job added");
        Ok(row)
    }

    pub async fn get(&self, id: i64) -> Result<ScheduledJobDbModel> {
        self.repo.get(id).await
    }

    pub async fn get_by_name(&self, name: &str) -> Result<ScheduledJobDbModel> {
        self.repo
            .get_by_name(name)
            .await?
            .ok_or_else(|| Error::not_found("ScheduledJob", name))
    }

    pub async fn list(&self) -> Result<Vec<ScheduledJobDbModel>> {
        self.repo.list().await
    }

    pub async fn update(&self, id: i64, update: ScheduledJobUpdate) -> Result<ScheduledJobDbModel> {
        if let Some(expression) = &update.cron_expression {
            CronSchedule::parse(expression)?;
        }
        if let Some(services) = &update.services {
            self.check_services(services)?;
        }
        if let Some(Some(template)) = &update.template {
            self.templates.get(template).await?;
        }

        let mut row = self.repo.update(id, &update, now_ms()).await?;

        if update.affects_schedule() {
            self.unregister(id);
            let next_run = if row.enabled {
                let schedule = CronSchedule::parse(&row.cron_expression)?;
                let next_run = self.next_after(&schedule, Utc::now());
                self.register(id, schedule, next_run);
                next_run
            } else {
                None
            };
            self.repo.set_next_run(id, next_run).await?;
            row.next_run = next_run;
            debug!(job = %row.name, enabled = row.enabled, "Scheduled job re-registered");
        }

        Ok(row)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.repo.delete(id).await?;
        self.unregister(id);
        info!(id, "Scheduled job deleted");
        Ok(())
    }

    pub async fn enable(&self, id: i64) -> Result<ScheduledJobDbModel> {
        self.update(
            id,
            ScheduledJobUpdate {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn disable(&self, id: i64) -> Result<ScheduledJobDbModel> {
        self.update(
            id,
            ScheduledJobUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    /// Number of jobs registered with the ticker.
    pub fn registered(&self) -> usize {
        self.jobs.read().len()
    }

    /// Earliest pending occurrence across registered jobs.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .read()
            .values()
            .map(|job| job.next_run_ms.load(Ordering::Acquire))
            .filter(|&ms| ms != NEVER)
            .min()
            .map(crate::database::time::ms_to_datetime)
    }

    /// Fire a job now, independent of its schedule.
    pub async fn trigger(&self, id: i64) -> Result<QueuedJobDbModel> {
        let next_run = self
            .jobs
            .read()
            .get(&id)
            .map(|job| job.next_run_ms.load(Ordering::Acquire))
            .filter(|&ms| ms != NEVER);
        self.fire(id, now_ms(), next_run).await
    }

    /// Fire every job due at `now` once and advance it past `now`.
    ///
    /// Returns the ids of the queued jobs created.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let now_ms = datetime_to_ms(now);

        let due: Vec<(i64, Option<i64>)> = {
            let jobs = self.jobs.read();
            jobs.iter()
                .filter_map(|(&id, job)| {
                    let current = job.next_run_ms.load(Ordering::Acquire);
                    if current > now_ms {
                        return None;
                    }
                    let next = self.next_after(&job.schedule, now);
                    // Another tick may have claimed this occurrence.
                    job.next_run_ms
                        .compare_exchange(
                            current,
                            next.unwrap_or(NEVER),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .ok()
                        .map(|_| (id, next))
                })
                .collect()
        };

        let mut queued = Vec::with_capacity(due.len());
        for (id, next_run) in due {
            match self.fire(id, now_ms, next_run).await {
                Ok(job) => queued.push(job.id),
                Err(e) => error!(scheduled_id = id, error = %e, "Failed to fire scheduled job"),
            }
        }
        Ok(queued)
    }

    async fn fire(&self, id: i64, now: i64, next_run: Option<i64>) -> Result<QueuedJobDbModel> {
        let job = self.repo.get(id).await?;
        let queued = self.queue.enqueue_at(self.materialize(&job).await?, now).await?;
        self.repo.record_run(id, now, next_run).await?;

        debug!(
            job = %job.name,
            queued_id = queued.id,
            priority = queued.priority,
            "Scheduled job fired"
        );
        Ok(queued)
    }

    /// Build the queued job for one tick, rendering the template if any.
    async fn materialize(&self, job: &ScheduledJobDbModel) -> Result<NewQueuedJob> {
        let mut metadata = job.metadata()?;
        let priority = metadata
            .get(PRIORITY_KEY)
            .and_then(|p| p.trim().parse::<i64>().ok())
            .unwrap_or(DEFAULT_PRIORITY);
        let max_retries = metadata
            .get(MAX_RETRIES_KEY)
            .and_then(|p| p.trim().parse::<i64>().ok())
            .filter(|&r| r >= 0)
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let (title, body) = match &job.template {
            Some(name) => match self.templates.render(name, &metadata).await {
                Ok(rendered) => (rendered.title, rendered.body),
                Err(e) => {
                    // Leave rendering to the worker, which fails the job before sending.
                    warn!(job = %job.name, template = %name, error = %e, "Template render failed at tick");
                    metadata.insert(TEMPLATE_KEY.to_string(), name.clone());
                    (job.title.clone(), job.body.clone())
                }
            },
            None => (job.title.clone(), job.body.clone()),
        };
        metadata.insert(JOB_NAME_KEY.to_string(), job.name.clone());

        Ok(NewQueuedJob::new(title, body, job.services()?)
            .with_scheduled_id(job.id)
            .with_notify_type(job.notify_type())
            .with_tags(job.tags()?)
            .with_metadata(metadata)
            .with_priority(priority)
            .with_max_retries(max_retries))
    }

    /// Run the ticker until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(timezone = %self.config.timezone, "Scheduler started");

        loop {
            let sleep_for = self
                .next_wakeup()
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(MAX_IDLE)
                .min(MAX_IDLE);

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scheduler received cancellation signal");
                    break;
                }
                _ = self.wake.notified() => continue,
                _ = tokio::time::sleep(sleep_for) => {
                    if let Err(e) = self.tick_at(Utc::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }
}
