//! Telegram Bot API endpoint.
//!
//! `tgram://{bot_token}/{chat_id}[/{chat_id}...][?format=html|markdown&silent=yes]`
//!
//! Sends via `POST /bot<token>/sendMessage`, once per chat. A 429 fails that
//! chat as transient without resending.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::http::HttpSender;
use super::webhook::truncate_for_error;
use super::{
    DeliveryEndpoint, DeliveryResult, EndpointFactory, EndpointUrl, HttpClientPool,
    ServiceCategory, escape_html, truncate_body,
};
use crate::error::DeliveryError;
use crate::notification::{BodyFormat, Notification};
use crate::{Error, Result};

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, PartialEq, Eq)]
struct TelegramTarget {
    bot_token: String,
    chat_ids: Vec<String>,
    parse_mode: &'static str,
    silent: bool,
}

fn parse_target(url: &EndpointUrl) -> Result<TelegramTarget> {
    let segments = url.segments();
    let Some((bot_token, chats)) = segments.split_first() else {
        return Err(Error::invalid_url(url.as_str(), "missing bot token"));
    };

    // Bot tokens look like `123456:ABC-DEF...`.
    let valid_token = bot_token
        .split_once(':')
        .is_some_and(|(id, secret)| {
            !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) && !secret.is_empty()
        });
    if !valid_token {
        return Err(Error::invalid_url(url.as_str(), "malformed bot token"));
    }
    if chats.is_empty() {
        return Err(Error::invalid_url(url.as_str(), "at least one chat id is required"));
    }

    let parse_mode = match url.query("format").as_deref() {
        None | Some("html") => "HTML",
        Some("markdown") => "MarkdownV2",
        Some(other) => {
            return Err(Error::invalid_url(
                url.as_str(),
                format!("unsupported format '{other}'"),
            ));
        }
    };
    let silent = url
        .query("silent")
        .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "yes" | "true" | "1"));

    Ok(TelegramTarget {
        bot_token: bot_token.to_string(),
        chat_ids: chats.iter().map(|c| c.to_string()).collect(),
        parse_mode,
        silent,
    })
}

/// Factory for Telegram endpoints.
pub struct TelegramFactory {
    api_base: String,
}

impl Default for TelegramFactory {
    fn default() -> Self {
        Self {
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }
}

impl TelegramFactory {
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }
}

impl EndpointFactory for TelegramFactory {
    fn service_id(&self) -> &'static str {
        "telegram"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["tgram", "telegram"]
    }

    fn parse(
        &self,
        url: &EndpointUrl,
        clients: &HttpClientPool,
    ) -> Result<Arc<dyn DeliveryEndpoint>> {
        Ok(Arc::new(TelegramEndpoint {
            target: parse_target(url)?,
            api_base: self.api_base.clone(),
            http: clients.sender(ServiceCategory::Cloud, "telegram"),
        }))
    }

    fn validate(&self, url: &EndpointUrl) -> Result<()> {
        parse_target(url).map(|_| ())
    }
}

/// Telegram notification endpoint.
pub struct TelegramEndpoint {
    target: TelegramTarget,
    api_base: String,
    http: HttpSender,
}

impl TelegramEndpoint {
    /// Build the message text for a notification.
    fn build_message(&self, notification: &Notification) -> String {
        let emoji = notification.notify_type.emoji();
        let text = if self.target.parse_mode == "HTML" {
            let title = escape_html(&notification.title);
            let body = if notification.body_format == Some(BodyFormat::Html) {
                notification.body.clone()
            } else {
                escape_html(&notification.body)
            };
            format!("{emoji} <b>{title}</b>\n\n{body}")
        } else {
            format!("{emoji} *{}*\n\n{}", notification.title, notification.body)
        };

        truncate_body(&text, TELEGRAM_MESSAGE_LIMIT).into_owned()
    }

    async fn post(&self, payload: &serde_json::Value, cancel: &CancellationToken) -> DeliveryResult {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.target.bot_token
        );
        let response = self.http.send(self.http.client().post(&url).json(payload), cancel).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, "Telegram sendMessage failed");
        Err(DeliveryError::from_status(status, truncate_for_error(&body)))
    }
}

#[async_trait]
impl DeliveryEndpoint for TelegramEndpoint {
    fn service_id(&self) -> &'static str {
        "telegram"
    }

    /// Sends to every chat. Fails if any chat failed, as transient when any
    /// failure was transient.
    async fn send(
        &self,
        notification: &Notification,
        cancel: &CancellationToken,
    ) -> DeliveryResult {
        let text = self.build_message(notification);
        let mut failures = Vec::new();

        for chat_id in &self.target.chat_ids {
            let payload = json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": self.target.parse_mode,
                "disable_notification": self.target.silent,
            });
            match self.post(&payload, cancel).await {
                Ok(()) => debug!(chat_id = %chat_id, "Telegram notification sent"),
                Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
                Err(e) => failures.push((chat_id.as_str(), e)),
            }
        }

        if failures.is_empty() {
            return Ok(());
        }

        let transient = failures.iter().any(|(_, e)| e.is_transient());
        let message = failures
            .iter()
            .map(|(chat, e)| format!("chat {chat}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(if transient {
            DeliveryError::Transient(message)
        } else {
            DeliveryError::Permanent(message)
        })
    }

    fn max_body_length(&self) -> usize {
        TELEGRAM_MESSAGE_LIMIT
    }

    fn default_port(&self) -> u16 {
        443
    }
}
