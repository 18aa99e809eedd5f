//! Template engine.
//!
//! Templates are stored in `notification_templates` and parsed lazily on
//! first use. Parsed templates are cached per name and re-parsed when the
//! stored row changes.

mod parser;

pub use parser::{CompiledTemplate, ParseError};

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::models::{Metadata, NewTemplate, TemplateDbModel};
use crate::database::repositories::TemplateRepository;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Rendered title and body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub title: String,
    pub body: String,
}

struct CachedTemplate {
    updated_at: i64,
    title_source: String,
    body_source: String,
    title: CompiledTemplate,
    body: CompiledTemplate,
    defaults: Metadata,
}

impl CachedTemplate {
    fn is_current(&self, row: &TemplateDbModel) -> bool {
        self.updated_at == row.updated_at
            && self.title_source == row.title
            && self.body_source == row.body
    }
}

fn compile(name: &str, field: &str, source: &str) -> Result<CompiledTemplate> {
    CompiledTemplate::parse(source)
        .map_err(|e| Error::template_syntax(name, format!("{field}: {e}")))
}

/// Variables injected into every render unless the caller supplies them.
fn system_vars(now: DateTime<Utc>) -> [(&'static str, String); 3] {
    [
        ("timestamp", now.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ("date", now.format("%Y-%m-%d").to_string()),
        ("time", now.format("%H:%M:%S").to_string()),
    ]
}

/// Renders stored templates with variable substitution.
pub struct TemplateEngine {
    repo: Arc<dyn TemplateRepository>,
    cache: DashMap<String, Arc<CachedTemplate>>,
}

impl TemplateEngine {
    pub fn new(repo: Arc<dyn TemplateRepository>) -> Self {
        Self {
            repo,
            cache: DashMap::new(),
        }
    }

    /// Parse title and body without rendering.
    pub fn validate(&self, template: &NewTemplate) -> Result<()> {
        if template.name.trim().is_empty() {
            return Err(Error::validation("template name must not be empty"));
        }
        compile(&template.name, "title", &template.title)?;
        compile(&template.name, "body", &template.body)?;
        Ok(())
    }

    /// Store a new template. Fails with `AlreadyExists` if the name is taken.
    pub async fn create(&self, template: &NewTemplate) -> Result<TemplateDbModel> {
        self.validate(template)?;
        self.repo.create(template, now_ms()).await
    }

    /// Create or replace a template.
    pub async fn save(&self, template: &NewTemplate) -> Result<TemplateDbModel> {
        self.validate(template)?;
        let now = now_ms();
        let saved = if self.repo.get_by_name(&template.name).await?.is_some() {
            self.repo.update(template, now).await?
        } else {
            self.repo.create(template, now).await?
        };
        self.cache.remove(&template.name);
        Ok(saved)
    }

    pub async fn get(&self, name: &str) -> Result<TemplateDbModel> {
        self.repo
            .get_by_name(name)
            .await?
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<TemplateDbModel>> {
        self.repo.list().await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.repo.delete(name).await?;
        self.cache.remove(name);
        Ok(())
    }

    /// Render `name` with `vars`; caller values override template defaults.
    pub async fn render(&self, name: &str, vars: &Metadata) -> Result<RenderedMessage> {
        self.render_at(name, vars, Utc::now()).await
    }

    /// Render with a fixed clock for the system variables.
    pub async fn render_at(
        &self,
        name: &str,
        vars: &Metadata,
        now: DateTime<Utc>,
    ) -> Result<RenderedMessage> {
        let compiled = self.load(name).await?;

        let mut merged = compiled.defaults.clone();
        merged.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (key, value) in system_vars(now) {
            merged.entry(key.to_string()).or_insert(value);
        }

        Ok(RenderedMessage {
            title: compiled.title.render(&merged),
            body: compiled.body.render(&merged),
        })
    }

    async fn load(&self, name: &str) -> Result<Arc<CachedTemplate>> {
        let row = self.get(name).await?;

        if let Some(entry) = self.cache.get(name) {
            if entry.is_current(&row) {
                return Ok(entry.clone());
            }
        }

        debug!(template = %name, "Compiling template");
        let compiled = Arc::new(CachedTemplate {
            title: compile(name, "title", &row.title)?,
            body: compile(name, "body", &row.body)?,
            defaults: row.variables()?,
            updated_at: row.updated_at,
            title_source: row.title,
            body_source: row.body,
        });
        self.cache.insert(name.to_string(), compiled.clone());
        Ok(compiled)
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxTemplateRepository;
    use crate::database::test_pool;
    use chrono::TimeZone;

    async fn engine() -> (TemplateEngine, sqlx::SqlitePool) {
        let pool = test_pool().await;
        let repo = Arc::new(SqlxTemplateRepository::new(pool.clone()));
        (TemplateEngine::new(repo), pool)
    }

    fn vars(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_caller_overrides_defaults() {
        let (engine, _pool) = engine().await;
        engine
            .create(
                &NewTemplate::new("alert", "Alert: {{alert_type}}", "Severity {{severity}}")
                    .with_variable("alert_type", "CPU")
                    .with_variable("severity", "medium"),
            )
            .await
            .unwrap();

        let rendered = engine
            .render("alert", &vars(&[("alert_type", "Disk")]))
            .await
            .unwrap();
        assert_eq!(rendered.title, "Alert: Disk");
        assert_eq!(rendered.body, "Severity medium");
    }

    #[tokio::test]
    async fn test_system_variables() {
        let (engine, _pool) = engine().await;
        engine
            .create(&NewTemplate::new("clock", "{{date}} {{time}}", "{{timestamp}}"))
            .await
            .unwrap();

        let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let rendered = engine.render_at("clock", &Metadata::new(), now).await.unwrap();
        assert_eq!(rendered.title, "2026-03-04 05:06:07");
        assert_eq!(rendered.body, "2026-03-04T05:06:07Z");

        let rendered = engine
            .render_at("clock", &vars(&[("date", "today")]), now)
            .await
            .unwrap();
        assert_eq!(rendered.title, "today 05:06:07");
    }

    #[tokio::test]
    async fn test_missing_template() {
        let (engine, _pool) = engine().await;
        let err = engine.render("nope", &Metadata::new()).await.unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_invalid_template_is_not_stored() {
        let (engine, _pool) = engine().await;
        let err = engine
            .save(&NewTemplate::new("broken", "{{#if x}}", "body"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TemplateSyntax { ref template, .. } if template == "broken"));
        assert!(engine.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_replaces_and_invalidates_cache() {
        let (engine, _pool) = engine().await;
        engine
            .save(&NewTemplate::new("greet", "Hi {{name}}", ""))
            .await
            .unwrap();
        let first = engine.render("greet", &vars(&[("name", "a")])).await.unwrap();
        assert_eq!(first.title, "Hi a");
        assert_eq!(engine.cached_len(), 1);

        engine
            .save(&NewTemplate::new("greet", "Hello {{name | upper}}", ""))
            .await
            .unwrap();
        let second = engine.render("greet", &vars(&[("name", "a")])).await.unwrap();
        assert_eq!(second.title, "Hello A");
    }

    #[tokio::test]
    async fn test_external_update_is_picked_up() {
        let (engine, pool) = engine().await;
        engine
            .create(&NewTemplate::new("t", "v1", ""))
            .await
            .unwrap();
        assert_eq!(engine.render("t", &Metadata::new()).await.unwrap().title, "v1");

        // Another process edits the row directly.
        sqlx::query("UPDATE notification_templates SET title = 'v2' WHERE name = 't'")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(engine.render("t", &Metadata::new()).await.unwrap().title, "v2");
    }

    #[tokio::test]
    async fn test_delete() {
        let (engine, _pool) = engine().await;
        engine.create(&NewTemplate::new("t", "x", "")).await.unwrap();
        engine.render("t", &Metadata::new()).await.unwrap();
        engine.delete("t").await.unwrap();
        assert_eq!(engine.cached_len(), 0);
        assert!(matches!(
            engine.delete("t").await.unwrap_err(),
            Error::TemplateNotFound(_)
        ));
    }
}
