//! Notification template models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{Metadata, decode_map};
use crate::Result;

/// Template database model.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct TemplateDbModel {
    pub id: i64,
    pub name: String,
    /// Title template source
    pub title: String,
    /// Body template source
    pub body: String,
    /// JSON object of default variable values
    pub variables: String,
    pub description: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TemplateDbModel {
    pub fn variables(&self) -> Result<Metadata> {
        decode_map(&self.variables)
    }
}

/// Input for creating or replacing a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub variables: Metadata,
    #[serde(default)]
    pub description: String,
}

impl NewTemplate {
    pub fn new(name: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            body: body.into(),
            variables: Metadata::new(),
            description: String::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}
