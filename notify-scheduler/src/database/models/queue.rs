//! Notification queue models.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{Metadata, decode_list, decode_map};
use crate::database::time::{ms_to_datetime, ns_to_duration};
use crate::notification::NotifyType;
use crate::{Error, Result};

/// Default job priority. Higher runs first.
pub const DEFAULT_PRIORITY: i64 = 1;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Default base retry delay.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Queued job database model.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct QueuedJobDbModel {
    pub id: i64,
    /// Back-reference to the scheduled job that produced this row.
    pub scheduled_id: Option<i64>,
    pub title: String,
    pub body: String,
    pub notify_type: String,
    /// JSON array of service URLs
    pub services: String,
    /// JSON array of tags
    pub tags: String,
    /// JSON object of string metadata
    pub metadata: String,
    pub priority: i64,
    pub max_retries: i64,
    pub retry_count: i64,
    /// Base retry delay in nanoseconds
    pub retry_delay_ns: i64,
    /// Status: pending, running, retrying, completed, failed
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub next_retry_at: Option<i64>,
}

impl QueuedJobDbModel {
    pub fn status(&self) -> Result<QueueStatus> {
        self.status.parse().map_err(|_| {
            Error::Other(format!(
                "queued job {} has unknown status '{}'",
                self.id, self.status
            ))
        })
    }

    pub fn services(&self) -> Result<Vec<String>> {
        decode_list(&self.services)
    }

    pub fn tags(&self) -> Result<Vec<String>> {
        decode_list(&self.tags)
    }

    pub fn metadata(&self) -> Result<Metadata> {
        decode_map(&self.metadata)
    }

    pub fn notify_type(&self) -> NotifyType {
        NotifyType::parse_or_default(&self.notify_type)
    }

    pub fn retry_delay(&self) -> Duration {
        ns_to_duration(self.retry_delay_ns)
    }

    pub fn attempts_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn next_retry_at_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.next_retry_at.map(ms_to_datetime)
    }
}

/// Input for `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueuedJob {
    pub scheduled_id: Option<i64>,
    pub title: String,
    pub body: String,
    pub notify_type: NotifyType,
    pub services: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: Metadata,
    pub priority: i64,
    pub max_retries: i64,
    pub retry_delay: Duration,
}

impl NewQueuedJob {
    pub fn new(title: impl Into<String>, body: impl Into<String>, services: Vec<String>) -> Self {
        Self {
            scheduled_id: None,
            title: title.into(),
            body: body.into(),
            notify_type: NotifyType::Info,
            services,
            tags: Vec::new(),
            metadata: Metadata::new(),
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_notify_type(mut self, notify_type: NotifyType) -> Self {
        self.notify_type = notify_type;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_scheduled_id(mut self, scheduled_id: i64) -> Self {
        self.scheduled_id = Some(scheduled_id);
        self
    }
}

/// Queue status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting for its first lease.
    Pending,
    /// Leased by exactly one worker.
    Running,
    /// Failed at least once; visible again after `next_retry_at`.
    Retrying,
    Completed,
    /// Attempts exhausted.
    Failed,
}

impl QueueStatus {
    /// Column value, as written by the strum derives.
    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine allows `self -> to`.
    pub fn can_transition_to(&self, to: QueueStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Retrying, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Retrying)
                | (Self::Running, Self::Failed)
        )
    }
}

/// Column values written by a single state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTransition {
    pub from: QueueStatus,
    pub to: QueueStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub next_retry_at: Option<i64>,
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn get(&self, status: QueueStatus) -> u64 {
        match status {
            QueueStatus::Pending => self.pending,
            QueueStatus::Running => self.running,
            QueueStatus::Retrying => self.retrying,
            QueueStatus::Completed => self.completed,
            QueueStatus::Failed => self.failed,
        }
    }

    pub(crate) fn set(&mut self, status: QueueStatus, count: u64) {
        match status {
            QueueStatus::Pending => self.pending = count,
            QueueStatus::Running => self.running = count,
            QueueStatus::Retrying => self.retrying = count,
            QueueStatus::Completed => self.completed = count,
            QueueStatus::Failed => self.failed = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.retrying + self.completed + self.failed
    }

    /// Status name to count, including zero entries.
    pub fn to_map(&self) -> std::collections::BTreeMap<String, u64> {
        use strum::IntoEnumIterator;
        QueueStatus::iter()
            .map(|s| (s.as_str().to_string(), self.get(s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_round_trip() {
        for s in ["pending", "running", "retrying", "completed", "failed"] {
            let status: QueueStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
            assert_eq!(status.to_string(), s);
        }
        assert!("PENDING".parse::<QueueStatus>().is_err());
        assert!("".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn test_transition_table() {
        use QueueStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Retrying.can_transition_to(Running));
        assert!(Running.can_transition_to(Retrying));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Retrying));
    }

    #[test]
    fn test_new_job_defaults() {
        let job = NewQueuedJob::new("t", "b", vec!["json://localhost".to_string()]);
        assert_eq!(job.priority, 1);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_stats_map_includes_zeroes() {
        let mut stats = QueueStats::default();
        stats.set(QueueStatus::Failed, 2);
        let map = stats.to_map();
        assert_eq!(map.len(), 5);
        assert_eq!(map["failed"], 2);
        assert_eq!(map["pending"], 0);
    }
}
