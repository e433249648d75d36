//! Message model: what flows from a source channel to a destination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::MessageId;

/// Reference to media stored by the platform (photo, video, document, ...).
///
/// The media bytes never pass through the engine; stages annotate the ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<String>,
}

impl MediaRef {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            watermark: None,
        }
    }
}

/// The part of a message stages operate on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payload {
    /// Text body, or caption for media messages.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<MediaRef>,
    /// Inline button labels, row by row.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<String>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media_ref = Some(media);
        self
    }

    pub fn with_buttons<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.buttons = labels.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub payload: Payload,
    pub source_timestamp: DateTime<Utc>,
    /// Platform id of the author, when the source exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<MessageId>, payload: Payload, source_timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            payload,
            source_timestamp,
            sender: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Same message, new payload.
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            id: self.id.clone(),
            payload,
            source_timestamp: self.source_timestamp,
            sender: self.sender.clone(),
        }
    }
}
