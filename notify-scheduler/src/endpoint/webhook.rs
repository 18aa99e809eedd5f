//! Generic JSON webhook endpoint.
//!
//! `json://[user[:pass]@]host[:port][/path][?options]` posts over HTTP,
//! `jsons://` over HTTPS. `webhook://` and `webhooks://` are aliases.
//!
//! Options:
//! - `method=POST|PUT|PATCH` (default POST)
//! - `token=...` sends `Authorization: Bearer ...`
//! - `+Header-Name=value` adds a request header
//! - any other key is forwarded to the target's query string

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::http::HttpSender;
use super::{
    DeliveryEndpoint, DeliveryResult, EndpointFactory, EndpointUrl, HttpClientPool,
    ServiceCategory,
};
use crate::error::DeliveryError;
use crate::notification::Notification;
use crate::{Error, Result};

/// Webhook authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAuth {
    Bearer { token: String },
    Basic { username: String, password: Option<String> },
}

#[derive(Debug, Clone)]
struct WebhookTarget {
    url: url::Url,
    method: Method,
    headers: HeaderMap,
    auth: Option<WebhookAuth>,
    secure: bool,
}

fn parse_target(endpoint_url: &EndpointUrl) -> Result<WebhookTarget> {
    let raw = endpoint_url.as_str();
    let secure = endpoint_url.scheme().ends_with('s');
    let host_port = endpoint_url.host_port();
    if host_port.is_empty() {
        return Err(Error::invalid_url(raw, "missing host"));
    }

    let proto = if secure { "https" } else { "http" };
    let mut url = url::Url::parse(&format!("{proto}://{host_port}{}", endpoint_url.path()))
        .map_err(|e| Error::invalid_url(raw, e.to_string()))?;

    let mut method = Method::POST;
    let mut headers = HeaderMap::new();
    let mut auth = endpoint_url.userinfo().map(|(user, pass)| WebhookAuth::Basic {
        username: user.to_string(),
        password: pass.map(str::to_string),
    });
    let mut forwarded = Vec::new();

    for (key, value) in endpoint_url.query_pairs() {
        if let Some(name) = key.strip_prefix('+') {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::invalid_url(raw, format!("invalid header name '{name}'")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| Error::invalid_url(raw, format!("invalid value for header '{name}'")))?;
            headers.insert(name, value);
        } else if key.eq_ignore_ascii_case("method") {
            method = match value.to_ascii_uppercase().as_str() {
                "POST" => Method::POST,
                "PUT" => Method::PUT,
                "PATCH" => Method::PATCH,
                other => {
                    return Err(Error::invalid_url(raw, format!("unsupported method '{other}'")));
                }
            };
        } else if key.eq_ignore_ascii_case("token") {
            if matches!(auth, Some(WebhookAuth::Basic { .. })) {
                return Err(Error::invalid_url(
                    raw,
                    "both basic credentials and a bearer token given",
                ));
            }
            auth = Some(WebhookAuth::Bearer { token: value });
        } else {
            forwarded.push((key, value));
        }
    }

    if !forwarded.is_empty() {
        url.query_pairs_mut().extend_pairs(forwarded);
    }

    Ok(WebhookTarget {
        url,
        method,
        headers,
        auth,
        secure,
    })
}

/// Factory for webhook endpoints.
pub struct WebhookFactory;

impl EndpointFactory for WebhookFactory {
    fn service_id(&self) -> &'static str {
        "webhook"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["json", "jsons", "webhook", "webhooks"]
    }

    fn parse(
        &self,
        url: &EndpointUrl,
        clients: &HttpClientPool,
    ) -> Result<Arc<dyn DeliveryEndpoint>> {
        Ok(Arc::new(WebhookEndpoint::parse(
            url,
            clients.sender(ServiceCategory::Webhook, "webhook"),
        )?))
    }

    fn validate(&self, url: &EndpointUrl) -> Result<()> {
        parse_target(url).map(|_| ())
    }
}

/// Generic JSON webhook endpoint.
pub struct WebhookEndpoint {
    http: HttpSender,
    target: WebhookTarget,
}

impl WebhookEndpoint {
    pub fn parse(url: &EndpointUrl, http: HttpSender) -> Result<Self> {
        Ok(Self {
            http,
            target: parse_target(url)?,
        })
    }

    pub fn auth(&self) -> Option<&WebhookAuth> {
        self.target.auth.as_ref()
    }

    /// Resolved HTTP(S) target.
    pub fn target_url(&self) -> &str {
        self.target.url.as_str()
    }

    fn build_payload(&self, notification: &Notification) -> serde_json::Value {
        json!({
            "version": "1.0",
            "title": notification.title,
            "message": notification.body,
            "type": notification.notify_type.as_str(),
            "tags": notification.tags,
            "format": notification.body_format.map(|f| f.to_string()),
            "attachment": notification.attachment,
            "source_url": notification.source_url,
        })
    }
}

#[async_trait]
impl DeliveryEndpoint for WebhookEndpoint {
    fn service_id(&self) -> &'static str {
        "webhook"
    }

    async fn send(
        &self,
        notification: &Notification,
        cancel: &CancellationToken,
    ) -> DeliveryResult {
        let payload = self.build_payload(notification);

        let mut request = self
            .http
            .client()
            .request(self.target.method.clone(), self.target.url.clone())
            .headers(self.target.headers.clone())
            .json(&payload);

        match &self.target.auth {
            Some(WebhookAuth::Bearer { token }) => request = request.bearer_auth(token),
            Some(WebhookAuth::Basic { username, password }) => {
                request = request.basic_auth(username, password.as_ref())
            }
            None => {}
        }

        let response = self.http.send(request, cancel).await?;
        let status = response.status();
        if status.is_success() {
            debug!(target_host = ?self.target.url.host_str(), "Webhook notification sent");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, "Webhook delivery failed");
        Err(DeliveryError::from_status(status, truncate_for_error(&body)))
    }

    fn supports_attachments(&self) -> bool {
        true
    }

    fn default_port(&self) -> u16 {
        if self.target.secure { 443 } else { 80 }
    }
}

/// Keep error messages short when a server echoes a large body.
pub(crate) fn truncate_for_error(body: &str) -> &str {
    match body.char_indices().nth(256) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
