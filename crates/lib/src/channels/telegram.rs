//! Telegram channel: long-poll getUpdates, classify messages, and the Bot
//! API calls the relay needs (copyMessage, sendMessage, forum topics).

use crate::channels::inbound::{ChatId, InboundEvent, MessageId, TopicMessage, UserMessage};
use crate::mapping::{TopicId, UserId};
use crate::relay::{RelayTransport, SendError};
use crate::resolver::{ProviderError, TopicProvider, UserProfile};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("telegram request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telegram api error: {0}")]
    Api(String),
}

impl TelegramError {
    /// True when the Bot API says the target message thread no longer exists.
    fn is_thread_missing(&self) -> bool {
        let TelegramError::Api(msg) = self else {
            return false;
        };
        let msg = msg.to_lowercase();
        msg.contains("message thread not found")
            || msg.contains("message thread is not found")
            || msg.contains("thread not found")
            || (msg.contains("topic") && msg.contains("closed"))
    }

    /// True for 403 responses (bot blocked by the user, chat never opened).
    fn is_forbidden(&self) -> bool {
        matches!(self, TelegramError::Api(m) if m.starts_with("403"))
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

/// Telegram update payload (getUpdates result item).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramAttachment>>,
    #[serde(default)]
    pub animation: Option<TelegramAttachment>,
    #[serde(default)]
    pub document: Option<TelegramAttachment>,
    #[serde(default)]
    pub video: Option<TelegramAttachment>,
    #[serde(default)]
    pub audio: Option<TelegramAttachment>,
    #[serde(default)]
    pub voice: Option<TelegramAttachment>,
    #[serde(default)]
    pub video_note: Option<TelegramAttachment>,
    #[serde(default)]
    pub sticker: Option<TelegramAttachment>,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub is_topic_message: bool,
    #[serde(default)]
    pub date: i64,
}

/// The part of any media payload the audit log keeps.
#[derive(Debug, Deserialize)]
pub struct TelegramAttachment {
    pub file_id: String,
}

impl TelegramMessage {
    // Animation before document: animation messages carry both fields.
    fn content_type(&self) -> &'static str {
        if self.photo.is_some() {
            "photo"
        } else if self.animation.is_some() {
            "animation"
        } else if self.document.is_some() {
            "document"
        } else if self.video.is_some() {
            "video"
        } else if self.audio.is_some() {
            "audio"
        } else if self.voice.is_some() {
            "voice"
        } else if self.video_note.is_some() {
            "video_note"
        } else if self.sticker.is_some() {
            "sticker"
        } else {
            "text"
        }
    }

    /// File id of the attachment; for photos, the largest size (last entry).
    fn file_id(&self) -> Option<String> {
        if let Some(photo) = &self.photo {
            return photo.last().map(|p| p.file_id.clone());
        }
        [
            &self.animation,
            &self.document,
            &self.video,
            &self.audio,
            &self.voice,
            &self.video_note,
            &self.sticker,
        ]
        .into_iter()
        .find_map(|a| a.as_ref().map(|a| a.file_id.clone()))
    }
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl TelegramUser {
    fn profile(&self) -> UserProfile {
        let display_name = match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        };
        UserProfile {
            id: self.id,
            display_name,
            username: self.username.clone(),
        }
    }
}

/// Turn a raw update into a relay event, or `None` for noise: bot authors,
/// General-thread chatter, service messages, unrelated chats.
fn classify_update(update: &TelegramUpdate, operator_group_id: ChatId) -> Option<InboundEvent> {
    let msg = update.message.as_ref()?;
    let from = msg.from.as_ref()?;
    if from.is_bot {
        return None;
    }
    let timestamp = Utc
        .timestamp_opt(msg.date, 0)
        .single()
        .unwrap_or_else(Utc::now);

    if msg.chat.kind == "private" {
        return Some(InboundEvent::FromUser(UserMessage {
            user: from.profile(),
            chat_id: msg.chat.id,
            message_id: msg.message_id,
            text: msg.text.clone(),
            content_type: msg.content_type().to_string(),
            caption: msg.caption.clone(),
            file_id: msg.file_id(),
            timestamp,
        }));
    }

    if msg.chat.id == operator_group_id && msg.is_topic_message {
        let topic_id = msg.message_thread_id?;
        return Some(InboundEvent::FromTopic(TopicMessage {
            topic_id,
            chat_id: msg.chat.id,
            message_id: msg.message_id,
            text: msg.text.clone(),
            content_type: msg.content_type().to_string(),
            caption: msg.caption.clone(),
            file_id: msg.file_id(),
            timestamp,
        }));
    }

    None
}

/// Telegram Bot API client: long-polls for updates and performs the relay's
/// outbound calls.
pub struct TelegramClient {
    base_url: String,
    token: String,
    operator_group_id: ChatId,
    running: AtomicBool,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(token: String, operator_group_id: ChatId) -> Self {
        Self {
            base_url: telegram_api_base(),
            token,
            operator_group_id,
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Start the getUpdates long-poll loop and forward relay events. Returns
    /// a handle to await on shutdown.
    pub fn start_inbound(
        self: Arc<Self>,
        inbound_tx: mpsc::Sender<InboundEvent>,
    ) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, inbound_tx).await;
        })
    }

    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, TelegramError> {
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TelegramError::Api(format!("{} {}", status.as_u16(), body)));
        }
        let data: ApiResponse = res.json().await?;
        if !data.ok {
            return Err(TelegramError::Api(
                data.description
                    .unwrap_or_else(|| format!("{} returned ok: false", method)),
            ));
        }
        Ok(data.result.unwrap_or(serde_json::Value::Null))
    }

    /// Call getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), TelegramError> {
        let url = format!(
            "{}/bot{}/getUpdates?timeout={}",
            self.base_url, self.token, LONG_POLL_TIMEOUT
        );
        let url = if let Some(off) = offset {
            format!("{}&offset={}", url, off)
        } else {
            url
        };
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TelegramError::Api(format!(
                "getUpdates failed: {} {}",
                status, body
            )));
        }
        let data: GetUpdatesResponse = res.json().await?;
        if !data.ok {
            return Err(TelegramError::Api("getUpdates returned ok: false".to_string()));
        }
        let next_offset = data
            .result
            .iter()
            .map(|u| u.update_id)
            .max()
            .map(|id| id + 1);
        Ok((data.result, next_offset))
    }

    /// getMe — the bot's own identity, logged at startup.
    pub async fn get_me(&self) -> Result<TelegramUser, TelegramError> {
        let result = self.call("getMe", json!({})).await?;
        serde_json::from_value(result)
            .map_err(|e| TelegramError::Api(format!("getMe: unexpected result: {}", e)))
    }

    /// sendMessage — plain text, optionally into a topic thread.
    pub async fn send_message(
        &self,
        chat_id: ChatId,
        thread: Option<TopicId>,
        text: &str,
    ) -> Result<MessageId, TelegramError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(topic_id) = thread {
            body["message_thread_id"] = topic_id.into();
        }
        let result = self.call("sendMessage", body).await?;
        extract_message_id("sendMessage", &result)
    }

    /// copyMessage — mirror a message into another chat (and topic thread).
    pub async fn copy_message(
        &self,
        chat_id: ChatId,
        thread: Option<TopicId>,
        from_chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<MessageId, TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "from_chat_id": from_chat_id,
            "message_id": message_id,
        });
        if let Some(topic_id) = thread {
            body["message_thread_id"] = topic_id.into();
        }
        let result = self.call("copyMessage", body).await?;
        extract_message_id("copyMessage", &result)
    }

    /// createForumTopic in the operator group; returns the new thread id.
    pub async fn create_forum_topic(&self, name: &str) -> Result<TopicId, TelegramError> {
        let result = self
            .call(
                "createForumTopic",
                json!({ "chat_id": self.operator_group_id, "name": name }),
            )
            .await?;
        result
            .get("message_thread_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                TelegramError::Api("createForumTopic: no message_thread_id in result".to_string())
            })
    }

    /// closeForumTopic in the operator group.
    pub async fn close_forum_topic(&self, topic_id: TopicId) -> Result<(), TelegramError> {
        self.call(
            "closeForumTopic",
            json!({ "chat_id": self.operator_group_id, "message_thread_id": topic_id }),
        )
        .await?;
        Ok(())
    }
}

async fn run_get_updates_loop(client: Arc<TelegramClient>, inbound_tx: mpsc::Sender<InboundEvent>) {
    let mut offset: Option<i64> = None;
    while client.running() {
        match client.get_updates(offset).await {
            Ok((updates, next)) => {
                offset = next;
                for update in updates {
                    if let Some(event) = classify_update(&update, client.operator_group_id) {
                        if inbound_tx.send(event).await.is_err() {
                            log::debug!("telegram: inbound channel closed, stopping loop");
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl TopicProvider for TelegramClient {
    async fn create_topic(&self, user: &UserProfile) -> Result<TopicId, ProviderError> {
        let topic_id = self
            .create_forum_topic(&user.topic_title())
            .await
            .map_err(provider_err)?;

        // Operator-facing banner; the topic is usable even if this fails.
        let username_line = user
            .username
            .as_deref()
            .map(|u| format!("@{}", u))
            .unwrap_or_else(|| "-".to_string());
        let banner = format!(
            "New conversation.\nUser: {}\nID: {}\nUsername: {}",
            user.display_name, user.id, username_line
        );
        if let Err(e) = self
            .send_message(self.operator_group_id, Some(topic_id), &banner)
            .await
        {
            log::warn!("posting banner into topic {} failed: {}", topic_id, e);
        }

        Ok(topic_id)
    }

    async fn close_topic(&self, topic_id: TopicId) -> Result<(), ProviderError> {
        self.close_forum_topic(topic_id).await.map_err(provider_err)
    }
}

#[async_trait]
impl RelayTransport for TelegramClient {
    async fn copy_to_topic(
        &self,
        topic_id: TopicId,
        from_chat: ChatId,
        message_id: MessageId,
    ) -> Result<MessageId, SendError> {
        self.copy_message(self.operator_group_id, Some(topic_id), from_chat, message_id)
            .await
            .map_err(send_err)
    }

    async fn copy_to_user(
        &self,
        user_id: UserId,
        from_chat: ChatId,
        message_id: MessageId,
    ) -> Result<MessageId, SendError> {
        // A private chat's id is the user's id.
        self.copy_message(user_id, None, from_chat, message_id)
            .await
            .map_err(send_err)
    }

    async fn notify_topic(&self, topic_id: TopicId, text: &str) -> Result<(), SendError> {
        self.send_message(self.operator_group_id, Some(topic_id), text)
            .await
            .map(|_| ())
            .map_err(send_err)
    }
}

/// The message id of a sent or copied message. A result without one is a
/// malformed response, never a valid id.
fn extract_message_id(
    method: &str,
    result: &serde_json::Value,
) -> Result<MessageId, TelegramError> {
    result
        .get("message_id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| TelegramError::Api(format!("{}: no message_id in result", method)))
}

fn provider_err(e: TelegramError) -> ProviderError {
    ProviderError::new(e.to_string())
}

fn send_err(e: TelegramError) -> SendError {
    SendError {
        topic_missing: e.is_thread_missing(),
        forbidden: e.is_forbidden(),
        message: e.to_string(),
    }
}

/// Resolve Telegram bot API base URL (for tests or custom endpoints).
fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE").unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}
