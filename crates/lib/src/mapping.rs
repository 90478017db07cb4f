//! Durable user <-> topic mapping (sqlite).
//!
//! One row per end user. Uniqueness of both `user_id` and `topic_id` is
//! enforced by the database constraints, so a lost create-or-find race
//! surfaces as [`StoreError::Conflict`] instead of a duplicate row. The
//! resolver relies on that: no in-process lock is held around topic creation.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

/// Stable platform identifier of an end user (Telegram user id).
pub type UserId = i64;

/// Identifier of a forum topic inside the operator group (message thread id).
pub type TopicId = i64;

/// A user's dedicated conversation: which forum topic mirrors their chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConversation {
    pub user_id: UserId,
    pub topic_id: TopicId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A mapping for this user_id or topic_id already exists. Recoverable:
    /// another writer won the race, re-read to find the surviving row.
    #[error("a mapping for this user or topic already exists")]
    Conflict,
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
  user_id          INTEGER PRIMARY KEY,
  topic_id         INTEGER NOT NULL UNIQUE,
  created_at       TEXT NOT NULL,
  last_activity_at TEXT NOT NULL
);
";

/// Sqlite-backed store of [`UserConversation`] rows. All mutation goes
/// through `create` / `touch_activity` (`remove` exists only for stale-topic
/// recovery).
pub struct MappingStore {
    pool: SqlitePool,
}

impl MappingStore {
    /// Open (creating if missing) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// In-memory store (single connection, so every query sees the same db).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool, shared with the history sink.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Point lookup by user id.
    pub async fn get_by_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserConversation>, StoreError> {
        let row: Option<(i64, i64, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT user_id, topic_id, created_at, last_activity_at \
             FROM conversations WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Self::to_conversation))
    }

    /// Reverse lookup by topic id, used to route operator replies.
    pub async fn get_by_topic(
        &self,
        topic_id: TopicId,
    ) -> Result<Option<UserConversation>, StoreError> {
        let row: Option<(i64, i64, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT user_id, topic_id, created_at, last_activity_at \
             FROM conversations WHERE topic_id = ?",
        )
        .bind(topic_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Self::to_conversation))
    }

    /// Insert a new mapping. Returns [`StoreError::Conflict`] when either the
    /// user or the topic is already mapped; the unique constraints make this
    /// safe under arbitrary concurrent invocation.
    pub async fn create(
        &self,
        user_id: UserId,
        topic_id: TopicId,
    ) -> Result<UserConversation, StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversations (user_id, topic_id, created_at, last_activity_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(topic_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return StoreError::Conflict;
                }
            }
            StoreError::Database(e)
        })?;
        Ok(UserConversation {
            user_id,
            topic_id,
            created_at: now,
            last_activity_at: now,
        })
    }

    /// Update `last_activity_at`. Advisory, last-writer-wins; callers log and
    /// ignore failures.
    pub async fn touch_activity(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE conversations SET last_activity_at = ? WHERE user_id = ?")
            .bind(at)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop a mapping. Only called when the platform reports the mapped topic
    /// gone (deleted out-of-band by an operator); normal relaying never
    /// deletes rows.
    pub async fn remove(&self, user_id: UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM conversations WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn to_conversation(row: (i64, i64, DateTime<Utc>, DateTime<Utc>)) -> UserConversation {
        let (user_id, topic_id, created_at, last_activity_at) = row;
        UserConversation {
            user_id,
            topic_id,
            created_at,
            last_activity_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn create_then_lookup_both_ways() {
        let store = MappingStore::open_in_memory().await.expect("open");
        let created = store.create(10, 100).await.expect("create");
        assert_eq!(created.user_id, 10);
        assert_eq!(created.topic_id, 100);

        let by_user = store.get_by_user(10).await.expect("get").expect("row");
        assert_eq!(by_user, created);
        let by_topic = store.get_by_topic(100).await.expect("get").expect("row");
        assert_eq!(by_topic, created);
    }

    #[tokio::test]
    async fn missing_rows_are_none() {
        let store = MappingStore::open_in_memory().await.expect("open");
        assert!(store.get_by_user(1).await.expect("get").is_none());
        assert!(store.get_by_topic(1).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn duplicate_user_is_conflict() {
        let store = MappingStore::open_in_memory().await.expect("open");
        store.create(10, 100).await.expect("create");
        let err = store.create(10, 101).await.expect_err("duplicate user");
        assert!(matches!(err, StoreError::Conflict));
        // The original mapping is untouched.
        let row = store.get_by_user(10).await.expect("get").expect("row");
        assert_eq!(row.topic_id, 100);
    }

    #[tokio::test]
    async fn duplicate_topic_is_conflict() {
        let store = MappingStore::open_in_memory().await.expect("open");
        store.create(10, 100).await.expect("create");
        let err = store.create(11, 100).await.expect_err("duplicate topic");
        assert!(matches!(err, StoreError::Conflict));
        assert!(store.get_by_user(11).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn touch_updates_last_activity_only() {
        let store = MappingStore::open_in_memory().await.expect("open");
        let created = store.create(10, 100).await.expect("create");
        let later = created.last_activity_at + Duration::seconds(90);
        store.touch_activity(10, later).await.expect("touch");
        let row = store.get_by_user(10).await.expect("get").expect("row");
        assert_eq!(row.created_at, created.created_at);
        assert_eq!(row.last_activity_at, later);
    }

    #[tokio::test]
    async fn removed_user_can_map_again() {
        let store = MappingStore::open_in_memory().await.expect("open");
        store.create(10, 100).await.expect("create");
        store.remove(10).await.expect("remove");
        assert!(store.get_by_user(10).await.expect("get").is_none());
        store.create(10, 101).await.expect("recreate");
    }
}
