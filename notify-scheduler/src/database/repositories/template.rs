//! Notification template repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::is_unique_violation;
use crate::database::models::{NewTemplate, TemplateDbModel, encode};
use crate::{Error, Result};

/// Template repository trait.
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn create(&self, template: &NewTemplate, now_ms: i64) -> Result<TemplateDbModel>;
    async fn get_by_name(&self, name: &str) -> Result<Option<TemplateDbModel>>;
    async fn list(&self) -> Result<Vec<TemplateDbModel>>;
    /// Replace the sources, defaults and description of an existing template.
    async fn update(&self, template: &NewTemplate, now_ms: i64) -> Result<TemplateDbModel>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// SQLx implementation of TemplateRepository.
pub struct SqlxTemplateRepository {
    pool: SqlitePool,
}

impl SqlxTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for SqlxTemplateRepository {
    async fn create(&self, template: &NewTemplate, now_ms: i64) -> Result<TemplateDbModel> {
        let variables = encode(&template.variables)?;

        let result = sqlx::query_as::<_, TemplateDbModel>(
            r#"
            INSERT INTO notification_templates (name, title, body, variables, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&template.name)
        .bind(&template.title)
        .bind(&template.body)
        .bind(&variables)
        .bind(&template.description)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(e) if is_unique_violation(&e) => {
                Err(Error::already_exists("Template", template.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<TemplateDbModel>> {
        let template = sqlx::query_as::<_, TemplateDbModel>(
            "SELECT * FROM notification_templates WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(template)
    }

    async fn list(&self) -> Result<Vec<TemplateDbModel>> {
        let templates = sqlx::query_as::<_, TemplateDbModel>(
            "SELECT * FROM notification_templates ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(templates)
    }

    async fn update(&self, template: &NewTemplate, now_ms: i64) -> Result<TemplateDbModel> {
        let variables = encode(&template.variables)?;

        sqlx::query_as::<_, TemplateDbModel>(
            r#"
            UPDATE notification_templates
            SET title = ?, body = ?, variables = ?, description = ?, updated_at = ?
            WHERE name = ?
            RETURNING *
            "#,
        )
        .bind(&template.title)
        .bind(&template.body)
        .bind(&variables)
        .bind(&template.description)
        .bind(now_ms)
        .bind(&template.name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::TemplateNotFound(template.name.clone()))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM notification_templates WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::TemplateNotFound(name.to_string()));
        }
        Ok(())
    }
}
