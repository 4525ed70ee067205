use serde::{Deserialize, Serialize};

use super::ids::{ContentHash, ConversationId, MessageId, StreamId};

/// Storage-local message role, intentionally decoupled from wire-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Where an image or file part gets its bytes from.
///
/// `Inline` holds a data URI or an http(s) URL. `Reference` holds an opaque local
/// reference: usually a content hash, occasionally a local-only URI that can never
/// leave the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PartSource {
    Inline(String),
    Reference(String),
}

impl PartSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Inline(value) | Self::Reference(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        source: PartSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    File {
        source: PartSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        name: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of every text part, in order.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } | ContentPart::File { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.iter().all(|part| match part {
                ContentPart::Text { text } => text.is_empty(),
                ContentPart::Image { .. } | ContentPart::File { .. } => false,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub seq: u64,
    pub role: MessageRole,
    pub content: MessageContent,
    pub stream_id: Option<StreamId>,
    pub attachments: Vec<ContentHash>,
    pub reasoning_text: Option<String>,
    // Only ever true on the assistant placeholder before its first delta lands.
    pub pending: bool,
    pub error: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: MessageContent,
    pub stream_id: Option<StreamId>,
    pub attachments: Vec<ContentHash>,
    pub reasoning_text: Option<String>,
    pub pending: bool,
    pub model: Option<String>,
}

impl NewMessage {
    pub fn user(content: MessageContent, attachments: Vec<ContentHash>) -> Self {
        Self {
            role: MessageRole::User,
            content,
            stream_id: None,
            attachments,
            reasoning_text: None,
            pending: false,
            model: None,
        }
    }

    pub fn assistant_placeholder(stream_id: StreamId, model: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::default(),
            stream_id: Some(stream_id),
            attachments: Vec::new(),
            reasoning_text: None,
            pending: true,
            model: Some(model.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub content: Option<MessageContent>,
    pub attachments: Option<Vec<ContentHash>>,
    pub reasoning_text: Option<String>,
    pub pending: Option<bool>,
    pub error: Option<String>,
}

impl MessagePatch {
    pub fn apply_to(self, record: &mut MessageRecord) {
        if let Some(content) = self.content {
            record.content = content;
        }
        if let Some(attachments) = self.attachments {
            record.attachments = attachments;
        }
        if let Some(reasoning_text) = self.reasoning_text {
            record.reasoning_text = Some(reasoning_text);
        }
        if let Some(pending) = self.pending {
            record.pending = pending;
        }
        if let Some(error) = self.error {
            record.error = Some(error);
        }
    }
}

/// Search direction for nearest-by-role lookups, relative to an anchor message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentMetadata {
    pub hash: ContentHash,
    pub media_type: String,
    pub size_bytes: u64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContent {
    pub bytes: bytes::Bytes,
    pub media_type: String,
    pub name: Option<String>,
}
