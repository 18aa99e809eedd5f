//! Discord webhook endpoint.
//!
//! `discord://{webhook_id}/{webhook_token}[?username=..&avatar_url=..]`
//!
//! A 429 is reported as a transient failure on the first response; the
//! queue's backoff schedules the next attempt.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::http::HttpSender;
use super::webhook::truncate_for_error;
use super::{
    DeliveryEndpoint, DeliveryResult, EndpointFactory, EndpointUrl, HttpClientPool,
    ServiceCategory, truncate_body,
};
use crate::error::DeliveryError;
use crate::notification::Notification;
use crate::{Error, Result};

/// Discord message body limit.
const DISCORD_BODY_LIMIT: usize = 2000;

const DISCORD_API_BASE: &str = "https://discord.com/api/webhooks";

#[derive(Debug, Clone, PartialEq, Eq)]
struct DiscordTarget {
    webhook_id: String,
    webhook_token: String,
    username: Option<String>,
    avatar_url: Option<String>,
}

fn parse_target(url: &EndpointUrl) -> Result<DiscordTarget> {
    let segments = url.segments();
    let [webhook_id, webhook_token, ..] = segments.as_slice() else {
        return Err(Error::invalid_url(
            url.as_str(),
            "expected discord://{webhook_id}/{webhook_token}",
        ));
    };
    if !webhook_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::invalid_url(url.as_str(), "webhook id must be numeric"));
    }

    Ok(DiscordTarget {
        webhook_id: webhook_id.to_string(),
        webhook_token: webhook_token.to_string(),
        username: url.query("username"),
        avatar_url: url.query("avatar_url"),
    })
}

/// Factory for Discord endpoints.
pub struct DiscordFactory {
    api_base: String,
}

impl Default for DiscordFactory {
    fn default() -> Self {
        Self {
            api_base: DISCORD_API_BASE.to_string(),
        }
    }
}

impl DiscordFactory {
    /// Point endpoints at a different API base.
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }
}

impl EndpointFactory for DiscordFactory {
    fn service_id(&self) -> &'static str {
        "discord"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["discord"]
    }

    fn parse(
        &self,
        url: &EndpointUrl,
        clients: &HttpClientPool,
    ) -> Result<Arc<dyn DeliveryEndpoint>> {
        Ok(Arc::new(DiscordEndpoint {
            target: parse_target(url)?,
            api_base: self.api_base.clone(),
            http: clients.sender(ServiceCategory::Cloud, "discord"),
        }))
    }

    fn validate(&self, url: &EndpointUrl) -> Result<()> {
        parse_target(url).map(|_| ())
    }
}

/// Discord notification endpoint.
pub struct DiscordEndpoint {
    target: DiscordTarget,
    api_base: String,
    http: HttpSender,
}

impl DiscordEndpoint {
    fn webhook_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.api_base.trim_end_matches('/'),
            self.target.webhook_id,
            self.target.webhook_token
        )
    }

    fn build_payload(&self, notification: &Notification) -> serde_json::Value {
        let mut embed = json!({
            "title": notification.title,
            "description": truncate_body(&notification.body, self.max_body_length()),
            "color": notification.notify_type.color(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if !notification.tags.is_empty() {
            let tags: Vec<&str> = notification.tags.iter().map(String::as_str).collect();
            embed["footer"] = json!({ "text": tags.join(", ") });
        }
        if let Some(source_url) = &notification.source_url {
            embed["url"] = json!(source_url);
        }

        let mut payload = json!({ "embeds": [embed] });
        if let Some(username) = &self.target.username {
            payload["username"] = json!(username);
        }
        if let Some(avatar_url) = &self.target.avatar_url {
            payload["avatar_url"] = json!(avatar_url);
        }
        payload
    }

    async fn post(&self, payload: &serde_json::Value, cancel: &CancellationToken) -> DeliveryResult {
        let url = self.webhook_url();
        let response = self.http.send(self.http.client().post(&url).json(payload), cancel).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, "Discord webhook failed");
        Err(DeliveryError::from_status(status, truncate_for_error(&body)))
    }
}

#[async_trait]
impl DeliveryEndpoint for DiscordEndpoint {
    fn service_id(&self) -> &'static str {
        "discord"
    }

    async fn send(
        &self,
        notification: &Notification,
        cancel: &CancellationToken,
    ) -> DeliveryResult {
        let payload = self.build_payload(notification);
        self.post(&payload, cancel).await?;
        debug!(webhook_id = %self.target.webhook_id, "Discord notification sent");
        Ok(())
    }

    fn max_body_length(&self) -> usize {
        DISCORD_BODY_LIMIT
    }

    fn default_port(&self) -> u16 {
        443
    }
}
