//! Tracing setup.
//!
//! One global subscriber with a reloadable [`EnvFilter`], a console layer and
//! a non-blocking daily file (`notify-scheduler.log.YYYY-MM-DD`) under the log
//! directory. Both outputs are plain text or JSON lines per [`LogFormat`].
//! Rotated files older than a week are pruned by a background task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::{Error, Result};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_FILTER: &str = "notify_scheduler=info,sqlx=warn";

/// Rolling file prefix; the appender adds `.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "notify-scheduler.log";

const RETENTION_DAYS: u64 = 7;
const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// RFC 3339 timestamps with millisecond precision in local time.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Log line format.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Runtime handle to the installed subscriber.
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    log_dir: PathBuf,
}

impl LogHandle {
    /// Directive of the active filter.
    pub fn filter(&self) -> String {
        self.filter
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Swap the active filter, e.g. `notify_scheduler=debug,sqlx=warn`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("invalid log filter '{directive}': {e}")))?;
        self.filter
            .reload(filter)
            .map_err(|e| Error::Other(format!("log filter reload failed: {e}")))?;
        info!(directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Prune rotated files once a day until `cancel` fires.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel: CancellationToken) {
        let dir = self.log_dir.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let today = Local::now().date_naive();
                        match prune_rotated_logs(&dir, today, RETENTION_DAYS).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, dir = %dir.display(), "Pruned old log files"),
                            Err(e) => warn!(error = %e, dir = %dir.display(), "Log pruning failed"),
                        }
                    }
                }
            }
            debug!("Log retention task stopped");
        });
    }
}

/// Rotation date of `file_name`, if it is one of our rotated files.
fn rotation_date(file_name: &str) -> Option<NaiveDate> {
    let suffix = file_name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

/// Remove rotated files dated more than `keep_days` before `today`.
async fn prune_rotated_logs(dir: &Path, today: NaiveDate, keep_days: u64) -> std::io::Result<usize> {
    let Some(cutoff) = today.checked_sub_days(chrono::Days::new(keep_days)) else {
        return Ok(0);
    };

    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let stale = entry
            .file_name()
            .to_str()
            .and_then(rotation_date)
            .is_some_and(|date| date < cutoff);
        if !stale {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Could not remove log file"),
        }
    }
    Ok(removed)
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must live as long
/// as the process logs.
pub fn init_logging(log_dir: &str, format: LogFormat) -> Result<(Arc<LogHandle>, WorkerGuard)> {
    let log_dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter, filter_handle) = reload::Layer::new(filter);

    let (console_text, console_json, file_text, file_json) = match format {
        LogFormat::Text => (
            Some(fmt::layer().with_timer(LocalTimer)),
            None,
            Some(fmt::layer().with_timer(LocalTimer).with_ansi(false).with_writer(file_writer)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_timer(LocalTimer)),
            None,
            Some(fmt::layer().json().with_timer(LocalTimer).with_writer(file_writer)),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_text)
        .with(console_json)
        .with(file_text)
        .with(file_json)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to install tracing subscriber: {e}")))?;

    Ok((
        Arc::new(LogHandle {
            filter: filter_handle,
            log_dir,
        }),
        guard,
    ))
}
