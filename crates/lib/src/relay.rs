//! Relay engine: routes inbound platform events to the right destination.
//!
//! Two independent flows. A user's private message is copied into their
//! dedicated topic in the operator group; a message posted inside a tracked
//! topic is copied back to the user's private chat. Side effects are strictly
//! ordered: send, then activity touch, then history (fire-and-forget).

use crate::channels::{InboundEvent, MessageId, TopicMessage, UserMessage};
use crate::history::{Direction, HistorySink, RelayedMessage};
use crate::mapping::{MappingStore, TopicId, UserId};
use crate::resolver::{ResolverError, TopicResolver};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// A failed outbound delivery.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SendError {
    pub message: String,
    /// The platform says the target thread no longer exists.
    pub topic_missing: bool,
    /// The user has blocked the bot or never opened a chat with it.
    pub forbidden: bool,
}

impl SendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            topic_missing: false,
            forbidden: false,
        }
    }
}

/// Outbound message delivery (the messaging platform).
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Copy a user's message into the given topic of the operator group.
    async fn copy_to_topic(
        &self,
        topic_id: TopicId,
        from_chat: crate::channels::ChatId,
        message_id: MessageId,
    ) -> Result<MessageId, SendError>;

    /// Copy an operator's message to the user's private chat.
    async fn copy_to_user(
        &self,
        user_id: UserId,
        from_chat: crate::channels::ChatId,
        message_id: MessageId,
    ) -> Result<MessageId, SendError>;

    /// Post a plain text note into a topic (operator-facing diagnostics).
    async fn notify_topic(&self, topic_id: TopicId, text: &str) -> Result<(), SendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error("send failed: {0}")]
    SendFailed(SendError),

    #[error("platform call timed out after {0:?}")]
    Timeout(Duration),
}

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Delivered; the id of the copy on the destination side.
    Delivered { message_id: MessageId },
    /// Not a tracked conversation (stray thread, General chatter); dropped.
    Ignored,
}

/// The orchestration core. Holds no state of its own; the mapping store is
/// the single source of truth, read fresh on every lookup.
pub struct RelayEngine {
    store: Arc<MappingStore>,
    resolver: Arc<TopicResolver>,
    transport: Arc<dyn RelayTransport>,
    history: Arc<dyn HistorySink>,
    request_timeout: Duration,
}

impl RelayEngine {
    pub fn new(
        store: Arc<MappingStore>,
        resolver: Arc<TopicResolver>,
        transport: Arc<dyn RelayTransport>,
        history: Arc<dyn HistorySink>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            transport,
            history,
            request_timeout,
        }
    }

    /// Route one inbound event. Invoked concurrently, once per event.
    pub async fn handle(&self, event: InboundEvent) -> Result<RelayOutcome, RelayError> {
        match event {
            InboundEvent::FromUser(msg) => self.relay_user_message(msg).await,
            InboundEvent::FromTopic(msg) => self.relay_topic_message(msg).await,
        }
    }

    async fn relay_user_message(&self, msg: UserMessage) -> Result<RelayOutcome, RelayError> {
        let topic_id = self.resolver.resolve(&msg.user).await?;

        // The topic the history record points at: always the last one the
        // send was attempted against, so a failed retry logs the fresh topic.
        let mut attempted_topic = topic_id;
        let sent = match self.send_to_topic(topic_id, &msg).await {
            Ok(copied) => Ok(copied),
            Err(RelayError::SendFailed(e)) if e.topic_missing => {
                // Operator deleted the topic out-of-band: drop the stale
                // mapping and deliver into a fresh one. One retry only.
                log::warn!(
                    "topic {} for user {} is gone, recreating",
                    topic_id,
                    msg.user.id
                );
                if let Err(err) = self.store.remove(msg.user.id).await {
                    log::warn!("dropping stale mapping for user {} failed: {}", msg.user.id, err);
                }
                let fresh = self.resolver.resolve(&msg.user).await?;
                attempted_topic = fresh;
                self.send_to_topic(fresh, &msg).await
            }
            Err(e) => Err(e),
        };

        match sent {
            Ok(copied) => {
                self.touch(msg.user.id, msg.timestamp).await;
                self.record(RelayedMessage {
                    direction: Direction::UserToOperator,
                    user_id: msg.user.id,
                    topic_id: attempted_topic,
                    chat_id: msg.chat_id,
                    message_id: msg.message_id,
                    text: msg.text.clone(),
                    content_type: msg.content_type.clone(),
                    caption: msg.caption.clone(),
                    file_id: msg.file_id.clone(),
                    delivered: true,
                    timestamp: msg.timestamp,
                });
                Ok(RelayOutcome::Delivered { message_id: copied })
            }
            Err(e) => {
                self.record(RelayedMessage {
                    direction: Direction::UserToOperator,
                    user_id: msg.user.id,
                    topic_id: attempted_topic,
                    chat_id: msg.chat_id,
                    message_id: msg.message_id,
                    text: msg.text.clone(),
                    content_type: msg.content_type.clone(),
                    caption: msg.caption.clone(),
                    file_id: msg.file_id.clone(),
                    delivered: false,
                    timestamp: msg.timestamp,
                });
                Err(e)
            }
        }
    }

    async fn relay_topic_message(&self, msg: TopicMessage) -> Result<RelayOutcome, RelayError> {
        let Some(user_id) = self.resolver.resolve_user(msg.topic_id).await? else {
            log::debug!("topic {}: not a tracked conversation, ignoring", msg.topic_id);
            return Ok(RelayOutcome::Ignored);
        };

        match self.send_to_user(user_id, &msg).await {
            Ok(copied) => {
                self.touch(user_id, msg.timestamp).await;
                self.record(RelayedMessage {
                    direction: Direction::OperatorToUser,
                    user_id,
                    topic_id: msg.topic_id,
                    chat_id: msg.chat_id,
                    message_id: msg.message_id,
                    text: msg.text.clone(),
                    content_type: msg.content_type.clone(),
                    caption: msg.caption.clone(),
                    file_id: msg.file_id.clone(),
                    delivered: true,
                    timestamp: msg.timestamp,
                });
                Ok(RelayOutcome::Delivered { message_id: copied })
            }
            Err(e) => {
                if let RelayError::SendFailed(send) = &e {
                    if send.forbidden {
                        // The operator should know the reply never arrived.
                        let note = "Could not deliver: the user has blocked the bot \
                                    or never opened a chat with it.";
                        let fut = self.transport.notify_topic(msg.topic_id, note);
                        match tokio::time::timeout(self.request_timeout, fut).await {
                            Ok(Ok(())) => {}
                            Ok(Err(n)) => log::warn!(
                                "posting delivery note into topic {} failed: {}",
                                msg.topic_id,
                                n
                            ),
                            Err(_) => log::warn!(
                                "posting delivery note into topic {} timed out",
                                msg.topic_id
                            ),
                        }
                    }
                }
                self.record(RelayedMessage {
                    direction: Direction::OperatorToUser,
                    user_id,
                    topic_id: msg.topic_id,
                    chat_id: msg.chat_id,
                    message_id: msg.message_id,
                    text: msg.text.clone(),
                    content_type: msg.content_type.clone(),
                    caption: msg.caption.clone(),
                    file_id: msg.file_id.clone(),
                    delivered: false,
                    timestamp: msg.timestamp,
                });
                Err(e)
            }
        }
    }

    async fn send_to_topic(
        &self,
        topic_id: TopicId,
        msg: &UserMessage,
    ) -> Result<MessageId, RelayError> {
        let fut = self
            .transport
            .copy_to_topic(topic_id, msg.chat_id, msg.message_id);
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(copied)) => Ok(copied),
            Ok(Err(e)) => Err(RelayError::SendFailed(e)),
            Err(_) => Err(RelayError::Timeout(self.request_timeout)),
        }
    }

    async fn send_to_user(
        &self,
        user_id: UserId,
        msg: &TopicMessage,
    ) -> Result<MessageId, RelayError> {
        let fut = self
            .transport
            .copy_to_user(user_id, msg.chat_id, msg.message_id);
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(copied)) => Ok(copied),
            Ok(Err(e)) => Err(RelayError::SendFailed(e)),
            Err(_) => Err(RelayError::Timeout(self.request_timeout)),
        }
    }

    async fn touch(&self, user_id: UserId, at: DateTime<Utc>) {
        if let Err(e) = self.store.touch_activity(user_id, at).await {
            log::warn!("touch_activity for user {} failed: {}", user_id, e);
        }
    }

    /// Hand a record to the history sink without waiting on it.
    fn record(&self, record: RelayedMessage) {
        let sink = Arc::clone(&self.history);
        tokio::spawn(async move {
            if let Err(e) = sink.record(record).await {
                log::debug!("history write failed: {}", e);
            }
        });
    }
}
