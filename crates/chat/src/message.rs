use adhikari_backend::{MessageId, MessageRecord, MessageRole};
use chrono::{DateTime, Utc};

/// Greeting shown before any history is available.
pub const WELCOME_MESSAGE: &str = "Hi! I'm your AI fashion stylist. I can help you with outfits for travel or special events. Just let me know what you need!";

const WELCOME_LOCAL_ID: u64 = 1;

/// Identity of one row in the chat panel.
///
/// Durable rows are keyed by their store id; local placeholders never reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Local(u64),
    Durable(MessageId),
}

impl MessageKey {
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Durable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub key: MessageKey,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn welcome(content: impl Into<String>) -> Self {
        Self {
            key: MessageKey::Local(WELCOME_LOCAL_ID),
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

impl From<MessageRecord> for ChatMessage {
    fn from(record: MessageRecord) -> Self {
        Self {
            key: MessageKey::Durable(record.id),
            role: record.role,
            content: record.content,
            timestamp: record.created_at,
        }
    }
}
