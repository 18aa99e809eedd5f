//! Repository layer.
//!
//! Each repository is an async trait with a sqlx-backed implementation so
//! services can be exercised against in-memory SQLite in tests.

pub mod metrics;
pub mod queue;
pub mod scheduled_job;
pub mod template;

pub use metrics::{MetricsRepository, SqlxMetricsRepository};
pub use queue::{QueueRepository, SqlxQueueRepository};
pub use scheduled_job::{ScheduledJobRepository, SqlxScheduledJobRepository};
pub use template::{SqlxTemplateRepository, TemplateRepository};

/// Whether a sqlx error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation()
                || db_err.message().contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}
