//! Inbound platform events delivered to the relay engine.

use crate::mapping::TopicId;
use crate::resolver::UserProfile;
use chrono::{DateTime, Utc};

/// Platform chat identifier (private chats share the user's id).
pub type ChatId = i64;

/// Platform message identifier, unique within a chat.
pub type MessageId = i64;

/// A message from an end user's private chat.
#[derive(Debug, Clone)]
pub struct UserMessage {
    pub user: UserProfile,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: Option<String>,
    /// Kind of payload ("text", "photo", "document", ...). Audit-only; the
    /// relay copies the message wholesale either way.
    pub content_type: String,
    pub caption: Option<String>,
    /// Platform file id of the attachment, if any.
    pub file_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A message posted inside a topic of the operator group.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic_id: TopicId,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: Option<String>,
    pub content_type: String,
    pub caption: Option<String>,
    pub file_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An event the relay engine routes: either side of a conversation.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    FromUser(UserMessage),
    FromTopic(TopicMessage),
}
