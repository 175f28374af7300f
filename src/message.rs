//! Canonical message model shared by every channel adapter.
//!
//! Adapters normalize their platform's native payloads into these shapes
//! before anything else in the system sees them. Inbound messages are
//! immutable once constructed and owned by the delivery queue until the
//! agent pipeline consumes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What kind of content an inbound message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Sticker,
    Location,
    Contact,
    Reaction,
}

/// A geographic point attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
}

/// A shared contact card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub display_name: String,
    /// Raw vCard payload when the platform provides one.
    pub vcard: Option<String>,
}

/// A reaction to a previously sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    /// Id of the message the reaction targets.
    pub target_id: String,
    /// The emoji, or empty when the platform signals reaction removal.
    pub emoji: String,
}

/// Descriptor for media attached to an inbound message. Holds whatever the
/// platform needs to fetch the bytes later; the bytes themselves are only
/// downloaded on demand through the media capability extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Platform-side identifier (file id, attachment id).
    pub id: Option<String>,
    /// Direct URL when the platform exposes one.
    pub url: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub file_name: Option<String>,
}

/// The normalized inbound message every adapter produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform message id, or a generated UUID when the platform gives none.
    pub id: String,
    /// Name of the adapter that produced this message (e.g. `"whatsapp"`).
    pub channel: String,
    /// Stable sender identifier in the platform's own terms.
    pub sender: String,
    /// Human-readable sender name, when the platform carries one.
    pub sender_name: Option<String>,
    /// Chat/group/channel the message arrived in. Equals the sender id for
    /// direct messages on platforms without a separate chat id.
    pub chat: String,
    pub is_group: bool,
    pub content_type: ContentType,
    /// Text content, or the caption for media messages. May be empty.
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Id of the message this one replies to, if any.
    pub reply_to: Option<String>,
    /// Text of the quoted message, when the platform inlines it.
    pub quoted_text: Option<String>,
    pub media: Option<MediaRef>,
    pub location: Option<Location>,
    pub contact: Option<ContactCard>,
    pub reaction: Option<Reaction>,
    /// Free-form per-platform extras that survived normalization.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl InboundMessage {
    /// A text message with everything optional left empty. Adapters start
    /// from this and fill in what their platform actually delivered.
    pub fn text(
        channel: impl Into<String>,
        sender: impl Into<String>,
        chat: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            sender: sender.into(),
            sender_name: None,
            chat: chat.into(),
            is_group: false,
            content_type: ContentType::Text,
            content: content.into(),
            timestamp: Utc::now(),
            reply_to: None,
            quoted_text: None,
            media: None,
            location: None,
            contact: None,
            reaction: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// A plain outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    /// Platform message id to reply to, if the caller wants threading.
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reply_to: None,
        }
    }

    pub fn reply(content: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reply_to: Some(reply_to.into()),
        }
    }
}

/// Where outbound media bytes come from. Exactly one source per message,
/// enforced by the type rather than by runtime validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Raw bytes uploaded through the platform API.
    Bytes(Vec<u8>),
    /// Remote URL the platform fetches (or that we embed as a link).
    Url(String),
}

/// An outbound media message for the media capability extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMessage {
    pub source: MediaSource,
    pub caption: Option<String>,
    pub mime_type: String,
    pub file_name: Option<String>,
    /// Pixel dimensions for images/video, when known.
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Duration in seconds for audio/video, when known.
    pub duration_secs: Option<u32>,
}

impl MediaMessage {
    pub fn from_url(url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            source: MediaSource::Url(url.into()),
            caption: None,
            mime_type: mime_type.into(),
            file_name: None,
            width: None,
            height: None,
            duration_secs: None,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            source: MediaSource::Bytes(bytes),
            caption: None,
            mime_type: mime_type.into(),
            file_name: None,
            width: None,
            height: None,
            duration_secs: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_constructor_fills_defaults() {
        let msg = InboundMessage::text("telegram", "alice", "chat-1", "hello");
        assert_eq!(msg.channel, "telegram");
        assert_eq!(msg.content_type, ContentType::Text);
        assert!(!msg.is_group);
        assert!(msg.media.is_none());
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn content_type_serializes_snake_case() {
        let json = serde_json::to_string(&ContentType::Document).unwrap();
        assert_eq!(json, "\"document\"");
    }

    #[test]
    fn inbound_roundtrips_through_json() {
        let mut msg = InboundMessage::text("slack", "U123", "C456", "ping");
        msg.metadata
            .insert("team".into(), serde_json::json!("T789"));
        let json = serde_json::to_string(&msg).unwrap();
        let back: InboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sender, "U123");
        assert_eq!(back.metadata.get("team"), Some(&serde_json::json!("T789")));
    }

    #[test]
    fn outbound_reply_carries_target() {
        let msg = OutboundMessage::reply("pong", "42");
        assert_eq!(msg.reply_to.as_deref(), Some("42"));
    }

    #[test]
    fn media_source_is_exclusive_by_construction() {
        let from_url = MediaMessage::from_url("https://example.com/a.png", "image/png");
        match from_url.source {
            MediaSource::Url(url) => assert!(url.ends_with("a.png")),
            MediaSource::Bytes(_) => panic!("expected url source"),
        }
    }
}
