//! Topic resolution: find or create the forum topic dedicated to a user.
//!
//! The create path is safe under concurrent first messages from the same
//! user without serializing the external create call: the store's uniqueness
//! constraint picks a winner, and the loser's freshly created topic is closed
//! as best-effort cleanup.

use crate::mapping::{MappingStore, StoreError, TopicId, UserId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Who a user is, as far as topic naming needs.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub username: Option<String>,
}

impl UserProfile {
    /// Human-readable topic label: `Name (@username) [id]`, capped at 128
    /// chars (the platform limit on topic names).
    pub fn topic_title(&self) -> String {
        let mut base = if self.display_name.trim().is_empty() {
            "User".to_string()
        } else {
            self.display_name.clone()
        };
        if let Some(username) = &self.username {
            base = format!("{} (@{})", base, username);
        }
        let title = format!("{} [{}]", base, self.id);
        title.chars().take(128).collect()
    }
}

/// Error from the external topic/messaging provider.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// External forum-topic operations (the messaging platform).
#[async_trait]
pub trait TopicProvider: Send + Sync {
    /// Create a forum topic for this user in the operator group.
    async fn create_topic(&self, user: &UserProfile) -> Result<TopicId, ProviderError>;

    /// Close a topic. Used as cleanup after a lost create race.
    async fn close_topic(&self, topic_id: TopicId) -> Result<(), ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The platform refused to create a topic (permissions, rate limit, ...).
    #[error("topic creation failed: {0}")]
    CreationFailed(ProviderError),

    /// Insert conflicted but no row exists for the user: the platform handed
    /// out a topic id that is already mapped to someone else.
    #[error("topic id {0} is already mapped to another user")]
    TopicCollision(TopicId),
}

/// Produces a ready-to-use topic id for a user, creating one exactly once.
/// Every provider call is bounded by `request_timeout`; a hung platform call
/// surfaces as [`ResolverError::CreationFailed`] like any other refusal.
pub struct TopicResolver {
    store: Arc<MappingStore>,
    provider: Arc<dyn TopicProvider>,
    request_timeout: Duration,
}

impl TopicResolver {
    pub fn new(
        store: Arc<MappingStore>,
        provider: Arc<dyn TopicProvider>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            request_timeout,
        }
    }

    /// Find or create the topic for `user`.
    pub async fn resolve(&self, user: &UserProfile) -> Result<TopicId, ResolverError> {
        if let Some(existing) = self.store.get_by_user(user.id).await? {
            return Ok(existing.topic_id);
        }

        let created = tokio::time::timeout(self.request_timeout, self.provider.create_topic(user));
        let topic_id = match created.await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => return Err(ResolverError::CreationFailed(e)),
            Err(_) => {
                return Err(ResolverError::CreationFailed(ProviderError::new(format!(
                    "topic creation timed out after {:?}",
                    self.request_timeout
                ))))
            }
        };

        match self.store.create(user.id, topic_id).await {
            Ok(row) => Ok(row.topic_id),
            Err(StoreError::Conflict) => {
                // Lost the race: a concurrent call mapped this user first.
                // Keep the winner's topic; ours is orphaned and gets closed.
                let Some(winner) = self.store.get_by_user(user.id).await? else {
                    return Err(ResolverError::TopicCollision(topic_id));
                };
                log::info!(
                    "user {}: concurrent topic creation, keeping topic {} and closing {}",
                    user.id,
                    winner.topic_id,
                    topic_id
                );
                let close = tokio::time::timeout(self.request_timeout, self.provider.close_topic(topic_id));
                match close.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!("closing orphaned topic {} failed: {}", topic_id, e),
                    Err(_) => log::warn!("closing orphaned topic {} timed out", topic_id),
                }
                Ok(winner.topic_id)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The user behind a topic, or `None` for untracked threads (stray
    /// messages in the group's General thread must not error).
    pub async fn resolve_user(&self, topic_id: TopicId) -> Result<Option<UserId>, ResolverError> {
        Ok(self.store.get_by_topic(topic_id).await?.map(|c| c.user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn user(id: UserId) -> UserProfile {
        UserProfile {
            id,
            display_name: format!("User {}", id),
            username: None,
        }
    }

    struct MockProvider {
        next_topic: AtomicI64,
        created: AtomicUsize,
        closed: Mutex<Vec<TopicId>>,
        fail: AtomicBool,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                next_topic: AtomicI64::new(100),
                created: AtomicUsize::new(0),
                closed: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TopicProvider for MockProvider {
        async fn create_topic(&self, _user: &UserProfile) -> Result<TopicId, ProviderError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProviderError::new("403 not enough rights"));
            }
            // Yield so two concurrent resolves can both pass the lookup.
            tokio::task::yield_now().await;
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(self.next_topic.fetch_add(1, Ordering::SeqCst))
        }

        async fn close_topic(&self, topic_id: TopicId) -> Result<(), ProviderError> {
            self.closed.lock().unwrap().push(topic_id);
            Ok(())
        }
    }

    async fn setup() -> (TopicResolver, Arc<MappingStore>, Arc<MockProvider>) {
        let store = Arc::new(MappingStore::open_in_memory().await.expect("open"));
        let provider = Arc::new(MockProvider::new());
        let resolver = TopicResolver::new(
            Arc::clone(&store),
            provider.clone(),
            Duration::from_secs(5),
        );
        (resolver, store, provider)
    }

    #[tokio::test]
    async fn resolve_is_idempotent_with_one_creation() {
        let (resolver, _store, provider) = setup().await;
        let first = resolver.resolve(&user(1)).await.expect("resolve");
        let second = resolver.resolve(&user(1)).await.expect("resolve");
        assert_eq!(first, second);
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_users_get_distinct_topics() {
        let (resolver, _store, _provider) = setup().await;
        let a = resolver.resolve(&user(1)).await.expect("resolve");
        let b = resolver.resolve(&user(2)).await.expect("resolve");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn creation_failure_leaves_no_row() {
        let (resolver, store, provider) = setup().await;
        provider.fail.store(true, Ordering::SeqCst);
        let err = resolver.resolve(&user(3)).await.expect_err("must fail");
        assert!(matches!(err, ResolverError::CreationFailed(_)));
        assert!(store.get_by_user(3).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn hung_topic_creation_is_cut_off_at_the_bound() {
        struct HungProvider;

        #[async_trait]
        impl TopicProvider for HungProvider {
            async fn create_topic(&self, _user: &UserProfile) -> Result<TopicId, ProviderError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(1)
            }

            async fn close_topic(&self, _topic_id: TopicId) -> Result<(), ProviderError> {
                Ok(())
            }
        }

        let store = Arc::new(MappingStore::open_in_memory().await.expect("open"));
        let resolver = TopicResolver::new(
            Arc::clone(&store),
            Arc::new(HungProvider),
            Duration::from_millis(50),
        );

        let started = std::time::Instant::now();
        let err = resolver.resolve(&user(5)).await.expect_err("must time out");
        assert!(matches!(err, ResolverError::CreationFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(store.get_by_user(5).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn lost_race_returns_winner_and_closes_orphan() {
        // Simulates the interleaving directly: the winner's row appears
        // between our lookup and our insert.
        struct RacingProvider {
            store: Arc<MappingStore>,
        }

        #[async_trait]
        impl TopicProvider for RacingProvider {
            async fn create_topic(&self, user: &UserProfile) -> Result<TopicId, ProviderError> {
                self.store
                    .create(user.id, 500)
                    .await
                    .map_err(|e| ProviderError::new(e.to_string()))?;
                Ok(501)
            }

            async fn close_topic(&self, _topic_id: TopicId) -> Result<(), ProviderError> {
                Ok(())
            }
        }

        let store = Arc::new(MappingStore::open_in_memory().await.expect("open"));
        let racing = Arc::new(RacingProvider {
            store: Arc::clone(&store),
        });
        let resolver = TopicResolver::new(Arc::clone(&store), racing, Duration::from_secs(5));

        let topic = resolver.resolve(&user(7)).await.expect("resolve");
        assert_eq!(topic, 500);
        let row = store.get_by_user(7).await.expect("get").expect("row");
        assert_eq!(row.topic_id, 500);
    }

    #[tokio::test]
    async fn concurrent_first_contact_keeps_one_mapping() {
        let (resolver, store, provider) = setup().await;
        let resolver = Arc::new(resolver);

        let user_a = user(9);
        let user_b = user(9);
        let (a, b) = tokio::join!(resolver.resolve(&user_a), resolver.resolve(&user_b));
        let a = a.expect("resolve a");
        let b = b.expect("resolve b");
        assert_eq!(a, b);

        let row = store.get_by_user(9).await.expect("get").expect("row");
        assert_eq!(row.topic_id, a);

        // Every topic created beyond the surviving one was closed.
        let created = provider.created.load(Ordering::SeqCst);
        let closed = provider.closed.lock().unwrap().len();
        assert_eq!(closed, created - 1);
    }

    #[tokio::test]
    async fn reverse_lookup_miss_is_none() {
        let (resolver, _store, _provider) = setup().await;
        assert!(resolver.resolve_user(4242).await.expect("resolve").is_none());
    }

    #[test]
    fn topic_title_formats_and_truncates() {
        let full = UserProfile {
            id: 42,
            display_name: "Jane Doe".to_string(),
            username: Some("jane".to_string()),
        };
        assert_eq!(full.topic_title(), "Jane Doe (@jane) [42]");

        let bare = UserProfile {
            id: 42,
            display_name: "  ".to_string(),
            username: None,
        };
        assert_eq!(bare.topic_title(), "User [42]");

        let long = UserProfile {
            id: 42,
            display_name: "x".repeat(300),
            username: None,
        };
        assert_eq!(long.topic_title().chars().count(), 128);
    }
}
