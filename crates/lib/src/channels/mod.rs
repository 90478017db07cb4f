//! Communication channel (Telegram).
//!
//! The Telegram client is both the inbound event source (getUpdates
//! long-poll) and the relay's outbound transport and topic provider.

mod inbound;
mod telegram;

pub use inbound::{ChatId, InboundEvent, MessageId, TopicMessage, UserMessage};
pub use telegram::{
    TelegramAttachment, TelegramChat, TelegramClient, TelegramError, TelegramMessage,
    TelegramUpdate, TelegramUser,
};
