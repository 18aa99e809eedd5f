//! The notification value handed to delivery endpoints.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Severity of a notification.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotifyType {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl NotifyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// Lenient parse; unknown values fall back to `Info`.
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }

    /// Embed color used by chat services.
    pub fn color(&self) -> u32 {
        match self {
            Self::Info => 0x3498db,    // Blue
            Self::Success => 0x2ecc71, // Green
            Self::Warning => 0xf39c12, // Orange
            Self::Error => 0xe74c3c,   // Red
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Info => "\u{2139}\u{fe0f}",
            Self::Success => "\u{2705}",
            Self::Warning => "\u{26a0}\u{fe0f}",
            Self::Error => "\u{1f6a8}",
        }
    }
}

/// Body markup.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    Text,
    Html,
    Markdown,
}

/// Opaque attachment handle.
///
/// The core passes the handle through untouched; endpoints that support
/// attachments resolve `location` themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// An immutable notification passed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub notify_type: NotifyType,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_format: Option<BodyFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            notify_type: NotifyType::Info,
            tags: BTreeSet::new(),
            body_format: None,
            attachment: None,
            source_url: None,
        }
    }

    pub fn with_type(mut self, notify_type: NotifyType) -> Self {
        self.notify_type = notify_type;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_format(mut self, format: BodyFormat) -> Self {
        self.body_format = Some(format);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_type_parse() {
        assert_eq!("warning".parse::<NotifyType>().unwrap(), NotifyType::Warning);
        assert_eq!(NotifyType::parse_or_default("bogus"), NotifyType::Info);
        assert_eq!(NotifyType::Error.to_string(), "error");
    }

    #[test]
    fn test_builder() {
        let n = Notification::new("Disk", "90% full")
            .with_type(NotifyType::Warning)
            .with_tags(["ops", "disk"])
            .with_format(BodyFormat::Markdown);

        assert_eq!(n.notify_type, NotifyType::Warning);
        assert!(n.tags.contains("ops"));
        assert_eq!(n.body_format, Some(BodyFormat::Markdown));
        assert!(n.attachment.is_none());
    }
}
