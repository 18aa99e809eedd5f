//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// SQL backend failure. Surfaced to the caller as-is.
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidEndpointUrl { url: String, reason: String },

    #[error("Unknown endpoint scheme: {0}")]
    UnknownScheme(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template syntax error in '{template}': {message}")]
    TemplateSyntax { template: String, message: String },

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("{entity_type} '{name}' already exists")]
    AlreadyExists { entity_type: String, name: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub fn already_exists(entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity_type: entity_type.into(),
            name: name.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpointUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn template_syntax(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TemplateSyntax {
            template: template.into(),
            message: message.into(),
        }
    }

    /// SQLite reported the database as busy or locked (codes 5 and 6).
    pub fn is_busy(&self) -> bool {
        let Self::DatabaseSqlx(err) = self else {
            return false;
        };
        if let sqlx::Error::Database(db) = err
            && matches!(db.code().as_deref(), Some("5") | Some("6"))
        {
            return true;
        }
        let msg = err.to_string().to_ascii_lowercase();
        msg.contains("database is locked") || msg.contains("database is busy")
    }
}

/// Error returned by a delivery endpoint's `send`.
///
/// The queue never branches on the variant; retries are driven by attempt count only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// 5xx, 429, timeouts, connection resets.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// 4xx other than 429, malformed credentials.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    #[error("cancelled")]
    Cancelled,
}

impl DeliveryError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// `Cancelled` counts as transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Cancelled)
    }

    /// Map an HTTP status code to a delivery error.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let msg = if body.is_empty() {
            status.to_string()
        } else {
            format!("{} - {}", status, body)
        };
        if status.as_u16() == 429 || status.is_server_error() {
            Self::Transient(msg)
        } else {
            Self::Permanent(msg)
        }
    }

    /// Map a transport error from reqwest.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_builder() {
            Self::Permanent(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}
