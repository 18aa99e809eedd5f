//! Cron-driven job scheduling.
//!
//! [`Scheduler`] keeps every enabled [`ScheduledJobDbModel`](crate::database::models::ScheduledJobDbModel)
//! registered against its [`CronSchedule`] and enqueues a queued job each
//! time an occurrence comes due. Missed occurrences are skipped rather than
//! replayed.

mod cron;
mod service;

pub use self::cron::CronSchedule;
pub use service::{
    JOB_NAME_KEY, MAX_RETRIES_KEY, PRIORITY_KEY, Scheduler, SchedulerConfig, TEMPLATE_KEY,
};
