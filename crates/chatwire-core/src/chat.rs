//! Chat vocabulary shared between the server, the credential store, and the
//! chat store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric user identifier as issued by the user store.
pub type UserId = i64;

/// Numeric chat identifier as issued by the chat store.
pub type ChatId = i64;

/// An authenticated identity, produced by validating a bearer token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// User ID.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
}

impl Principal {
    /// Create a principal.
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// Broadcast routing key. Chat topics are the decimal chat ID.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Create a topic from any string key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Topic for a chat.
    pub fn chat(chat_id: ChatId) -> Self {
        Self(chat_id.to_string())
    }

    /// The raw routing key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret the topic as a chat ID, if it is one.
    pub fn chat_id(&self) -> Option<ChatId> {
        self.0.parse().ok()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl PartialEq<str> for Topic {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Name and kind of a chat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    /// Chat ID.
    pub chat_id: ChatId,
    /// Display name.
    pub chat_name: String,
    /// Kind of chat (`"private"`, `"group"`, ...).
    pub chat_type: String,
}

/// One row of a user's chat list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    /// Chat ID.
    pub chat_id: ChatId,
    /// Display name.
    pub chat_name: String,
    /// Kind of chat.
    pub chat_type: String,
    /// Text of the newest message, if any.
    pub last_message: Option<String>,
    /// Time of the newest message, if any.
    pub last_message_time: Option<DateTime<Utc>>,
    /// Messages newer than the user's last read receipt.
    pub unread_count: u64,
}

/// Result of persisting a new message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    /// Assigned message ID.
    pub message_id: i64,
    /// Server-side timestamp.
    pub sent_at: DateTime<Utc>,
}

/// A message as read back from the store for one viewer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message ID.
    pub message_id: i64,
    /// Author user ID.
    pub sender_id: UserId,
    /// Author display name.
    pub sender_name: String,
    /// Message body.
    pub text: String,
    /// When it was sent.
    pub time: DateTime<Utc>,
    /// Whether the viewer wrote it.
    pub is_own: bool,
}
