//! Process configuration.
//!
//! Read once at startup from environment variables, with `.env` support via
//! dotenvy. Every variable is optional.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | `sqlite:notify-scheduler.db?mode=rwc` |
//! | `LOG_DIR` | `logs` |
//! | `LOG_FORMAT` | `text` (`text` or `json`) |
//! | `SCHEDULER_TIMEZONE` | `UTC` |
//! | `QUEUE_POLL_INTERVAL_SECS` | `10` |
//! | `QUEUE_BATCH_SIZE` | `10` |
//! | `QUEUE_MAX_CONCURRENT_JOBS` | `4` |
//! | `DISPATCH_DEADLINE_SECS` | `60` |
//! | `DISPATCH_MAX_CONCURRENCY` | `16` |
//! | `LEASE_TIMEOUT_SECS` | `900` |
//! | `QUEUE_RETENTION_DAYS` | `30` |
//! | `METRICS_RETENTION_DAYS` | `30` |
//! | `MAINTENANCE_INTERVAL_SECS` | `3600` |

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::database::MaintenanceConfig;
use crate::dispatch::DispatcherConfig;
use crate::logging::LogFormat;
use crate::scheduler::SchedulerConfig;
use crate::worker::WorkerConfig;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:notify-scheduler.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "logs";

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    pub log_format: LogFormat,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub dispatcher: DispatcherConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            log_format: LogFormat::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let timezone = match env.get("SCHEDULER_TIMEZONE") {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| Error::config(format!("SCHEDULER_TIMEZONE: {e}")))?,
            None => defaults.scheduler.timezone,
        };

        Ok(Self {
            database_url: env.get("DATABASE_URL").unwrap_or(defaults.database_url),
            log_dir: env.get("LOG_DIR").unwrap_or(defaults.log_dir),
            log_format: env.parse("LOG_FORMAT", defaults.log_format)?,
            scheduler: SchedulerConfig { timezone },
            worker: WorkerConfig {
                poll_interval: env.secs("QUEUE_POLL_INTERVAL_SECS", defaults.worker.poll_interval)?,
                batch_size: env.positive("QUEUE_BATCH_SIZE", defaults.worker.batch_size)?,
                max_concurrent_jobs: env
                    .positive("QUEUE_MAX_CONCURRENT_JOBS", defaults.worker.max_concurrent_jobs)?,
                dispatch_deadline: env
                    .secs("DISPATCH_DEADLINE_SECS", defaults.worker.dispatch_deadline)?,
            },
            dispatcher: DispatcherConfig {
                max_concurrency: env
                    .positive("DISPATCH_MAX_CONCURRENCY", defaults.dispatcher.max_concurrency)?,
            },
            maintenance: MaintenanceConfig {
                interval: env.secs("MAINTENANCE_INTERVAL_SECS", defaults.maintenance.interval)?,
                queue_retention: env
                    .days("QUEUE_RETENTION_DAYS", defaults.maintenance.queue_retention)?,
                metrics_retention: env
                    .days("METRICS_RETENTION_DAYS", defaults.maintenance.metrics_retention)?,
                lease_timeout: env.secs("LEASE_TIMEOUT_SECS", defaults.maintenance.lease_timeout)?,
            },
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-blank value of `key`, trimmed.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::config(format!("{key}={raw:?}: {e}"))),
            None => Ok(default),
        }
    }

    fn positive<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr + PartialOrd + Default,
        T::Err: Display,
    {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            return Err(Error::config(format!("{key} must be greater than zero")));
        }
        Ok(value)
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        self.positive(key, default.as_secs()).map(Duration::from_secs)
    }

    fn days(&self, key: &str, default: Duration) -> Result<Duration> {
        self.positive(key, default.as_secs() / SECS_PER_DAY)
            .map(|days| Duration::from_secs(days.saturating_mul(SECS_PER_DAY)))
    }
}
