//! Scheduled job models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{Metadata, decode_list, decode_map};
use crate::database::time::ms_to_datetime;
use crate::notification::NotifyType;
use crate::Result;

/// Scheduled job database model.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ScheduledJobDbModel {
    pub id: i64,
    pub name: String,
    /// Standard 5-field cron expression
    pub cron_expression: String,
    pub title: String,
    pub body: String,
    pub notify_type: String,
    /// JSON array of service URLs
    pub services: String,
    /// JSON array of tags
    pub tags: String,
    /// JSON object of string metadata
    pub metadata: String,
    /// Template name rendered on each tick
    pub template: Option<String>,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub next_run: Option<i64>,
    pub last_run: Option<i64>,
    /// Free-form summary of the last run
    pub last_status: Option<String>,
    pub run_count: i64,
}

impl ScheduledJobDbModel {
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

    pub fn next_run_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.next_run.map(ms_to_datetime)
    }

    pub fn last_run_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.last_run.map(ms_to_datetime)
    }
}

/// Input for creating a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewScheduledJob {
    pub name: String,
    pub cron_expression: String,
    pub title: String,
    pub body: String,
    pub notify_type: NotifyType,
    pub services: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewScheduledJob {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        services: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            title: String::new(),
            body: String::new(),
            notify_type: NotifyType::Info,
            services,
            tags: Vec::new(),
            metadata: Metadata::new(),
            template: None,
            enabled: true,
        }
    }

    pub fn with_message(mut self, title: impl Into<String>, body: impl Into<String>) -> Self {
        self.title = title.into();
        self.body = body.into();
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

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update of a scheduled job. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJobUpdate {
    pub cron_expression: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub notify_type: Option<NotifyType>,
    pub services: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Metadata>,
    /// `Some(None)` clears the template.
    pub template: Option<Option<String>>,
    pub enabled: Option<bool>,
}

impl ScheduledJobUpdate {
    /// Whether the update requires re-registering the job with the ticker.
    pub fn affects_schedule(&self) -> bool {
        self.cron_expression.is_some() || self.enabled.is_some()
    }
}
