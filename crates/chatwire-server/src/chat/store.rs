//! Query interface to users, chats and messages, plus an in-memory backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chatwire_core::{ChatId, ChatInfo, ChatMessage, ChatSummary, Principal, StoredMessage, UserId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from a chat store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The chat does not exist.
    #[error("chat {0} not found")]
    ChatNotFound(ChatId),

    /// The backend could not serve the query.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Seed file could not be read.
    #[error("seed I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Seed file is not valid JSON.
    #[error("seed parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Storage the message processor queries.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Whether `user_id` belongs to `chat_id`.
    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, StoreError>;

    /// Name and kind of a chat.
    async fn chat_info(&self, chat_id: ChatId) -> Result<Option<ChatInfo>, StoreError>;

    /// Persist a message and return its ID and timestamp.
    async fn insert_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        text: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Display name of a user.
    async fn username(&self, user_id: UserId) -> Result<Option<String>, StoreError>;

    /// The user's chats, most recently active first.
    async fn chats_for_user(&self, user_id: UserId) -> Result<Vec<ChatSummary>, StoreError>;

    /// A chat's history as seen by `viewer`, oldest first. Marks everything
    /// returned as read for `viewer`.
    async fn messages_for_chat(
        &self,
        chat_id: ChatId,
        viewer: UserId,
    ) -> Result<Vec<ChatMessage>, StoreError>;
}

/// Seed file contents.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    /// Users.
    pub users: Vec<SeedUser>,
    /// Chats with their members.
    pub chats: Vec<SeedChat>,
    /// Messages, inserted in order.
    pub messages: Vec<SeedMessage>,
}

/// A seeded user.
#[derive(Clone, Debug, Deserialize)]
pub struct SeedUser {
    /// User ID.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
}

/// A seeded chat.
#[derive(Clone, Debug, Deserialize)]
pub struct SeedChat {
    /// Chat ID.
    pub chat_id: ChatId,
    /// Display name.
    pub chat_name: String,
    /// Kind of chat.
    #[serde(default = "default_chat_type")]
    pub chat_type: String,
    /// Member user IDs.
    #[serde(default)]
    pub members: Vec<UserId>,
}

fn default_chat_type() -> String {
    "group".into()
}

/// A seeded message.
#[derive(Clone, Debug, Deserialize)]
pub struct SeedMessage {
    /// Chat it belongs to.
    pub chat_id: ChatId,
    /// Author.
    pub sender_id: UserId,
    /// Body.
    pub text: String,
}

struct ChatRecord {
    info: ChatInfo,
    members: BTreeSet<UserId>,
}

struct MessageRecord {
    message_id: i64,
    chat_id: ChatId,
    sender_id: UserId,
    text: String,
    sent_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    users: BTreeMap<UserId, String>,
    chats: BTreeMap<ChatId, ChatRecord>,
    messages: Vec<MessageRecord>,
    /// Highest message ID each user has read, per chat.
    read_marks: HashMap<(UserId, ChatId), i64>,
    next_message_id: i64,
}

/// [`ChatStore`] held entirely in memory.
#[derive(Default)]
pub struct InMemoryChatStore {
    inner: RwLock<Inner>,
}

impl InMemoryChatStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store populated from a seed. Messages naming unknown chats are skipped.
    pub fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        for user in seed.users {
            store.add_user(user.user_id, user.username);
        }
        for chat in seed.chats {
            store.add_chat(
                ChatInfo {
                    chat_id: chat.chat_id,
                    chat_name: chat.chat_name,
                    chat_type: chat.chat_type,
                },
                chat.members,
            );
        }
        for msg in seed.messages {
            let _ = store.append(msg.chat_id, msg.sender_id, &msg.text);
        }
        store
    }

    /// Store populated from a JSON seed file.
    pub fn load_seed(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        let seed: Seed = serde_json::from_str(&content)?;
        let store = Self::from_seed(seed);
        let inner = store.inner.read();
        info!(
            path = %path.display(),
            users = inner.users.len(),
            chats = inner.chats.len(),
            messages = inner.messages.len(),
            "chat store seeded"
        );
        drop(inner);
        Ok(store)
    }

    /// Add or rename a user.
    pub fn add_user(&self, user_id: UserId, username: impl Into<String>) {
        let _ = self.inner.write().users.insert(user_id, username.into());
    }

    /// Add or replace a chat and its membership.
    pub fn add_chat(&self, info: ChatInfo, members: impl IntoIterator<Item = UserId>) {
        let record = ChatRecord {
            members: members.into_iter().collect(),
            info,
        };
        let _ = self.inner.write().chats.insert(record.info.chat_id, record);
    }

    /// Every known user.
    pub fn users(&self) -> Vec<Principal> {
        self.inner
            .read()
            .users
            .iter()
            .map(|(id, name)| Principal::new(*id, name.clone()))
            .collect()
    }

    fn append(&self, chat_id: ChatId, sender_id: UserId, text: &str) -> Result<StoredMessage, StoreError> {
        let mut inner = self.inner.write();
        if !inner.chats.contains_key(&chat_id) {
            return Err(StoreError::ChatNotFound(chat_id));
        }
        inner.next_message_id += 1;
        let stored = StoredMessage {
            message_id: inner.next_message_id,
            sent_at: Utc::now(),
        };
        inner.messages.push(MessageRecord {
            message_id: stored.message_id,
            chat_id,
            sender_id,
            text: text.to_owned(),
            sent_at: stored.sent_at,
        });
        debug!(chat_id, sender_id, message_id = stored.message_id, "message stored");
        Ok(stored)
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .read()
            .chats
            .get(&chat_id)
            .is_some_and(|c| c.members.contains(&user_id)))
    }

    async fn chat_info(&self, chat_id: ChatId) -> Result<Option<ChatInfo>, StoreError> {
        Ok(self.inner.read().chats.get(&chat_id).map(|c| c.info.clone()))
    }

    async fn insert_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        text: &str,
    ) -> Result<StoredMessage, StoreError> {
        self.append(chat_id, sender_id, text)
    }

    async fn username(&self, user_id: UserId) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().users.get(&user_id).cloned())
    }

    async fn chats_for_user(&self, user_id: UserId) -> Result<Vec<ChatSummary>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<(Option<i64>, ChatSummary)> = inner
            .chats
            .values()
            .filter(|c| c.members.contains(&user_id))
            .map(|c| {
                let chat_id = c.info.chat_id;
                let read_up_to = inner.read_marks.get(&(user_id, chat_id)).copied().unwrap_or(0);
                let mut last: Option<&MessageRecord> = None;
                let mut unread = 0;
                for m in inner.messages.iter().filter(|m| m.chat_id == chat_id) {
                    if m.message_id > read_up_to && m.sender_id != user_id {
                        unread += 1;
                    }
                    last = Some(m);
                }
                let summary = ChatSummary {
                    chat_id,
                    chat_name: c.info.chat_name.clone(),
                    chat_type: c.info.chat_type.clone(),
                    last_message: last.map(|m| m.text.clone()),
                    last_message_time: last.map(|m| m.sent_at),
                    unread_count: unread,
                };
                (last.map(|m| m.message_id), summary)
            })
            .collect();
        // Newest activity first, chats without messages last.
        rows.sort_by_key(|(last_id, _)| std::cmp::Reverse(*last_id));
        let summaries = rows.into_iter().map(|(_, summary)| summary).collect();
        Ok(summaries)
    }

    async fn messages_for_chat(
        &self,
        chat_id: ChatId,
        viewer: UserId,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let mut inner = self.inner.write();
        if !inner.chats.contains_key(&chat_id) {
            return Err(StoreError::ChatNotFound(chat_id));
        }
        let messages: Vec<ChatMessage> = inner
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| ChatMessage {
                message_id: m.message_id,
                sender_id: m.sender_id,
                sender_name: inner
                    .users
                    .get(&m.sender_id)
                    .cloned()
                    .unwrap_or_else(|| "Unknown".into()),
                text: m.text.clone(),
                time: m.sent_at,
                is_own: m.sender_id == viewer,
            })
            .collect();
        if let Some(newest) = messages.last() {
            let _ = inner.read_marks.insert((viewer, chat_id), newest.message_id);
        }
        Ok(messages)
    }
}
