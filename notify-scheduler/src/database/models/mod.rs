//! Database models.
//!
//! Rows map 1:1 onto tables. JSON columns (`services`, `tags`, `metadata`,
//! `variables`) are kept as TEXT and decoded on access.

pub mod metrics;
pub mod queue;
pub mod scheduled_job;
pub mod template;

pub use metrics::{MetricsSampleDbModel, NewMetricsSample, SampleStatus};
pub use queue::{
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_RETRY_DELAY, NewQueuedJob, QueueStats,
    QueueStatus, QueueTransition, QueuedJobDbModel,
};
pub use scheduled_job::{NewScheduledJob, ScheduledJobDbModel, ScheduledJobUpdate};
pub use template::{NewTemplate, TemplateDbModel};

use std::collections::BTreeMap;

/// String-to-string map stored in JSON columns.
pub type Metadata = BTreeMap<String, String>;

pub(crate) fn decode_list(raw: &str) -> crate::Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn decode_map(raw: &str) -> crate::Result<Metadata> {
    if raw.trim().is_empty() {
        return Ok(Metadata::new());
    }
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn encode<T: serde::Serialize + ?Sized>(value: &T) -> crate::Result<String> {
    Ok(serde_json::to_string(value)?)
}
