//! Delivery endpoints.
//!
//! A [`DeliveryEndpoint`] is a configured target built from a service URL by
//! an [`EndpointFactory`]. The [`EndpointRegistry`] maps URL schemes to
//! factories. Built-in adapters:
//! - Generic JSON webhooks (`json://`, `jsons://`, `webhook://`, `webhooks://`)
//! - Discord webhooks (`discord://`)
//! - Telegram Bot API (`tgram://`, `telegram://`)

mod discord;
pub mod http;
mod registry;
mod telegram;
mod url;
mod webhook;

pub use discord::{DiscordEndpoint, DiscordFactory};
pub use http::{HttpClientPool, HttpObserver, HttpSender, ServiceCategory};
pub use registry::{EndpointRegistry, EndpointRegistryBuilder};
pub use telegram::{TelegramEndpoint, TelegramFactory};
pub use self::url::EndpointUrl;
pub use webhook::{WebhookAuth, WebhookEndpoint, WebhookFactory};

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::error::DeliveryError;
use crate::notification::Notification;

/// Result of a single delivery attempt.
pub type DeliveryResult = std::result::Result<(), DeliveryError>;

/// Marker appended to bodies cut at `max_body_length`.
pub const TRUNCATION_MARKER: &str = "\n\n[truncated]";

/// The capability set every delivery target implements.
#[async_trait]
pub trait DeliveryEndpoint: Send + Sync {
    /// Short stable identifier, e.g. `discord`.
    fn service_id(&self) -> &'static str;

    /// Deliver one notification. Must return `Cancelled` promptly once
    /// `cancel` fires.
    async fn send(&self, notification: &Notification, cancel: &CancellationToken)
    -> DeliveryResult;

    fn supports_attachments(&self) -> bool {
        false
    }

    /// Maximum body length in characters; 0 means unlimited.
    fn max_body_length(&self) -> usize {
        0
    }

    fn default_port(&self) -> u16;
}

/// Builds endpoints for one or more URL schemes.
pub trait EndpointFactory: Send + Sync {
    fn service_id(&self) -> &'static str;

    /// Schemes handled by this factory. Case-sensitive.
    fn schemes(&self) -> &'static [&'static str];

    /// Parse `url` into a configured endpoint.
    fn parse(&self, url: &EndpointUrl, clients: &HttpClientPool)
    -> Result<Arc<dyn DeliveryEndpoint>>;

    /// Pre-flight parse without building anything.
    fn validate(&self, url: &EndpointUrl) -> Result<()>;
}

/// Cut `text` to at most `limit` characters, ending with [`TRUNCATION_MARKER`].
///
/// `limit == 0` means unlimited.
pub fn truncate_body(text: &str, limit: usize) -> Cow<'_, str> {
    if limit == 0 || text.chars().count() <= limit {
        return Cow::Borrowed(text);
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if limit <= marker_len {
        return Cow::Owned(TRUNCATION_MARKER.chars().take(limit).collect());
    }
    let kept: String = text.chars().take(limit - marker_len).collect();
    Cow::Owned(format!("{kept}{TRUNCATION_MARKER}"))
}

/// Minimal HTML escaping for services that render HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("hello", 100), "hello");
        assert_eq!(truncate_body("hello", 0), "hello");

        let long = "a".repeat(5000);
        let truncated = truncate_body(&long, 4096);
        assert_eq!(truncated.chars().count(), 4096);
        assert!(truncated.ends_with("[truncated]"));
    }

    #[test]
    fn test_truncate_multibyte() {
        let text = "\u{00e9}".repeat(50);
        let truncated = truncate_body(&text, 20);
        assert_eq!(truncated.chars().count(), 20);
        assert!(truncated.starts_with('\u{00e9}'));
    }

    #[test]
    fn test_truncate_tiny_limit() {
        let truncated = truncate_body("abcdefghijklmnopqrstuvwxyz", 5);
        assert_eq!(truncated.chars().count(), 5);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>&\"</b>"), "&lt;b&gt;&amp;&quot;&lt;/b&gt;");
    }
}
