//! Message history: append-only audit log of relayed messages.
//!
//! Strictly best-effort. The relay path hands records off and never waits on
//! or fails because of this module.

use crate::channels::{ChatId, MessageId};
use crate::mapping::{TopicId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    UserToOperator,
    OperatorToUser,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::UserToOperator => "user",
            Direction::OperatorToUser => "operator",
        }
    }
}

/// One relayed (or attempted) message.
#[derive(Debug, Clone)]
pub struct RelayedMessage {
    pub direction: Direction,
    pub user_id: UserId,
    pub topic_id: TopicId,
    /// Chat the message originated in.
    pub chat_id: ChatId,
    /// Platform message id in the originating chat.
    pub message_id: MessageId,
    pub text: Option<String>,
    /// Kind of payload ("text", "photo", "document", ...).
    pub content_type: String,
    pub caption: Option<String>,
    /// Platform file id of the attachment, if any.
    pub file_id: Option<String>,
    /// False when the outbound send failed; the attempt is still logged.
    pub delivered: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("history write failed: {0}")]
pub struct HistoryError(#[from] sqlx::Error);

/// Audit sink for relayed messages. Failures are logged by the engine and
/// never propagate into the relay path.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, message: RelayedMessage) -> Result<(), HistoryError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id    INTEGER NOT NULL,
  direction  TEXT NOT NULL,
  topic_id   INTEGER NOT NULL,
  chat_id    INTEGER NOT NULL,
  message_id INTEGER NOT NULL,
  text       TEXT,
  content_type TEXT NOT NULL DEFAULT 'text',
  caption    TEXT,
  file_id    TEXT,
  delivered  INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_chat_message
  ON messages(chat_id, message_id);
";

/// Appends to a sqlite `messages` table. Re-logging the same platform
/// message is a no-op (unique on chat_id + message_id).
pub struct SqliteHistorySink {
    pool: SqlitePool,
}

impl SqliteHistorySink {
    pub async fn new(pool: SqlitePool) -> Result<Self, HistoryError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl HistorySink for SqliteHistorySink {
    async fn record(&self, m: RelayedMessage) -> Result<(), HistoryError> {
        sqlx::query(
            "INSERT INTO messages \
             (user_id, direction, topic_id, chat_id, message_id, text, \
              content_type, caption, file_id, delivered, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (chat_id, message_id) DO NOTHING",
        )
        .bind(m.user_id)
        .bind(m.direction.as_str())
        .bind(m.topic_id)
        .bind(m.chat_id)
        .bind(m.message_id)
        .bind(&m.text)
        .bind(&m.content_type)
        .bind(&m.caption)
        .bind(&m.file_id)
        .bind(m.delivered)
        .bind(m.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Used when history logging is disabled in config.
pub struct NullHistorySink;

#[async_trait]
impl HistorySink for NullHistorySink {
    async fn record(&self, _message: RelayedMessage) -> Result<(), HistoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    fn message(message_id: MessageId, delivered: bool) -> RelayedMessage {
        RelayedMessage {
            direction: Direction::UserToOperator,
            user_id: 1,
            topic_id: 100,
            chat_id: 1,
            message_id,
            text: Some("hello".to_string()),
            content_type: "text".to_string(),
            caption: None,
            file_id: None,
            delivered,
            timestamp: Utc::now(),
        }
    }

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn records_are_appended_once() {
        let sink = SqliteHistorySink::new(memory_pool().await)
            .await
            .expect("sink");
        sink.record(message(5, true)).await.expect("record");
        // Same platform message again: dropped by the unique index.
        sink.record(message(5, true)).await.expect("record again");
        sink.record(message(6, false)).await.expect("record");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&sink.pool)
            .await
            .expect("count");
        assert_eq!(count, 2);

        let (delivered,): (bool,) =
            sqlx::query_as("SELECT delivered FROM messages WHERE message_id = 6")
                .fetch_one(&sink.pool)
                .await
                .expect("fetch");
        assert!(!delivered);
    }

    #[tokio::test]
    async fn attachment_reference_is_stored() {
        let sink = SqliteHistorySink::new(memory_pool().await)
            .await
            .expect("sink");
        let mut photo = message(7, true);
        photo.text = None;
        photo.content_type = "photo".to_string();
        photo.caption = Some("receipt".to_string());
        photo.file_id = Some("abc123".to_string());
        sink.record(photo).await.expect("record");

        let (content_type, caption, file_id): (String, Option<String>, Option<String>) =
            sqlx::query_as(
                "SELECT content_type, caption, file_id FROM messages WHERE message_id = 7",
            )
            .fetch_one(&sink.pool)
            .await
            .expect("fetch");
        assert_eq!(content_type, "photo");
        assert_eq!(caption.as_deref(), Some("receipt"));
        assert_eq!(file_id.as_deref(), Some("abc123"));
    }
}
