//! Delivery metrics sample models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One delivery attempt against one endpoint. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct MetricsSampleDbModel {
    pub id: i64,
    pub job_id: Option<i64>,
    pub scheduled_job_id: Option<i64>,
    pub service_id: String,
    pub service_url: String,
    pub notification_type: String,
    /// Status: success, failed
    pub status: String,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    /// JSON object
    pub metadata: String,
    pub timestamp: i64,
}

impl MetricsSampleDbModel {
    pub fn is_success(&self) -> bool {
        self.status == SampleStatus::Success.as_str()
    }
}

/// Input for appending a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMetricsSample {
    pub job_id: Option<i64>,
    pub scheduled_job_id: Option<i64>,
    pub service_id: String,
    pub service_url: String,
    pub notification_type: String,
    pub status: SampleStatus,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub metadata: String,
    pub timestamp: i64,
}

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
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    Success,
    Failed,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }

    pub fn from_success(success: bool) -> Self {
        if success { Self::Success } else { Self::Failed }
    }
}
