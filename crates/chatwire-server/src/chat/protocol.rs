//! Application messages carried in text frames.
//!
//! Two dialects share the channel: JSON objects with a `type` discriminator,
//! and the older colon-delimited text commands. [`decode`] turns either into a
//! [`ClientMessage`] and remembers which dialect the client spoke, so replies
//! go back in the same one via [`ServerMessage::render`].

use std::fmt::Write as _;

use chatwire_core::{ChatId, ChatMessage, ChatSummary, Principal, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Which wire dialect a message arrived in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    /// `{"type": ...}` objects.
    Json,
    /// `AUTH:<token>`, `JOIN_CHAT:<id>`, ...
    Legacy,
}

/// A decoded inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    /// Present a bearer token.
    Auth {
        /// The token, possibly empty.
        token: String,
    },
    /// Switch the session's broadcast topic to a chat.
    JoinChat {
        /// Target chat.
        chat_id: ChatId,
    },
    /// Post a message. Without a chat ID it goes to the session's current chat.
    SendMessage {
        /// Target chat, if named.
        chat_id: Option<ChatId>,
        /// Message body.
        text: String,
    },
    /// List the user's chats.
    GetChats,
    /// Read a chat's history.
    GetMessages {
        /// Chat to read.
        chat_id: ChatId,
    },
    /// Liveness check.
    Ping,
}

impl ClientMessage {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::JoinChat { .. } => "join_chat",
            Self::SendMessage { .. } => "message",
            Self::GetChats => "get_chats",
            Self::GetMessages { .. } => "get_messages",
            Self::Ping => "ping",
        }
    }
}

/// A message that could not be decoded. The display text is what the
/// client sees in the error reply.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Text starting with `{` that is not a JSON object.
    #[error("Invalid JSON format")]
    InvalidJson,
    /// JSON object with a missing or unrecognized `type`.
    #[error("Unknown message type")]
    UnknownType,
    /// Legacy text with no recognized prefix.
    #[error("Unknown message format")]
    UnknownFormat,
    /// Legacy command with missing arguments.
    #[error("Invalid format")]
    InvalidFormat,
    /// `chat_id` absent where one is needed.
    #[error("Chat ID required")]
    MissingChatId,
    /// `chat_id` present but not an integer.
    #[error("Invalid chat ID")]
    InvalidChatId,
    /// Message text absent or blank.
    #[error("Message text is empty")]
    EmptyText,
}

/// Decode one text frame.
///
/// Text whose first non-blank character is `{` is JSON; everything else is
/// matched against the legacy prefixes.
pub fn decode(raw: &str) -> (Dialect, Result<ClientMessage, ProtocolError>) {
    if raw.trim_start().starts_with('{') {
        (Dialect::Json, decode_json(raw))
    } else {
        (Dialect::Legacy, decode_legacy(raw))
    }
}

fn decode_json(raw: &str) -> Result<ClientMessage, ProtocolError> {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(raw) else {
        return Err(ProtocolError::InvalidJson);
    };

    match obj.get("type").and_then(Value::as_str) {
        Some("auth") => Ok(ClientMessage::Auth {
            token: obj
                .get("token")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        }),
        Some("join_chat") => Ok(ClientMessage::JoinChat {
            chat_id: json_chat_id(&obj)?.ok_or(ProtocolError::MissingChatId)?,
        }),
        Some("message") => {
            let text = obj
                .get("text")
                .and_then(Value::as_str)
                .filter(|t| !t.trim().is_empty())
                .ok_or(ProtocolError::EmptyText)?;
            let chat_id = json_chat_id(&obj)?.ok_or(ProtocolError::MissingChatId)?;
            Ok(ClientMessage::SendMessage {
                chat_id: Some(chat_id),
                text: text.to_owned(),
            })
        }
        Some("get_chats") => Ok(ClientMessage::GetChats),
        Some("get_messages") => Ok(ClientMessage::GetMessages {
            chat_id: json_chat_id(&obj)?.ok_or(ProtocolError::MissingChatId)?,
        }),
        Some("ping") => Ok(ClientMessage::Ping),
        _ => Err(ProtocolError::UnknownType),
    }
}

/// `chat_id` as a number or a numeric string.
fn json_chat_id(obj: &Map<String, Value>) -> Result<Option<ChatId>, ProtocolError> {
    match obj.get("chat_id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or(ProtocolError::InvalidChatId),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProtocolError::InvalidChatId),
        Some(_) => Err(ProtocolError::InvalidChatId),
    }
}

fn decode_legacy(raw: &str) -> Result<ClientMessage, ProtocolError> {
    if let Some(token) = raw.strip_prefix("AUTH:") {
        return Ok(ClientMessage::Auth {
            token: token.trim().to_owned(),
        });
    }
    if let Some(id) = raw.strip_prefix("JOIN_CHAT:") {
        let chat_id = id.trim().parse().map_err(|_| ProtocolError::InvalidChatId)?;
        return Ok(ClientMessage::JoinChat { chat_id });
    }
    if let Some(text) = raw.strip_prefix("MESSAGE:") {
        let text = text.trim();
        if text.is_empty() {
            return Err(ProtocolError::EmptyText);
        }
        return Ok(ClientMessage::SendMessage {
            chat_id: None,
            text: text.to_owned(),
        });
    }
    if raw.starts_with("GET_CHATS") {
        return Ok(ClientMessage::GetChats);
    }
    if let Some(rest) = raw.strip_prefix("GET_MESSAGES:") {
        let id = rest.split(':').next().map(str::trim).unwrap_or_default();
        if id.is_empty() {
            return Err(ProtocolError::InvalidFormat);
        }
        let chat_id = id.parse().map_err(|_| ProtocolError::InvalidChatId)?;
        return Ok(ClientMessage::GetMessages { chat_id });
    }
    if raw == "PING" {
        return Ok(ClientMessage::Ping);
    }
    Err(ProtocolError::UnknownFormat)
}

/// Outcome of an authentication attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    /// Token accepted.
    Success,
    /// Token rejected.
    Error,
}

/// An outbound message, before rendering into a dialect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    Auth {
        /// Outcome.
        status: AuthStatus,
        /// Authenticated user, on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        /// Authenticated user's name, on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        /// Failure reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// The session now receives broadcasts for a chat.
    ChatJoined {
        /// Chat ID.
        chat_id: ChatId,
        /// Display name.
        chat_name: String,
        /// Kind of chat.
        chat_type: String,
    },
    /// Broadcast of a newly posted message.
    NewMessage {
        /// Assigned message ID.
        message_id: i64,
        /// Chat it was posted to.
        chat_id: ChatId,
        /// Author.
        sender_id: UserId,
        /// Author's display name.
        sender_name: String,
        /// Body.
        text: String,
        /// Server timestamp.
        time: DateTime<Utc>,
    },
    /// Acknowledgement to the author of a posted message.
    MessageSent {
        /// Assigned message ID.
        message_id: i64,
    },
    /// The user's chat list.
    Chats {
        /// One entry per chat.
        chats: Vec<ChatSummary>,
    },
    /// A chat's history.
    Messages {
        /// Chat ID.
        chat_id: ChatId,
        /// Oldest first.
        messages: Vec<ChatMessage>,
    },
    /// Reply to a ping.
    Pong,
    /// Recoverable per-message failure.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// Successful authentication.
    pub fn auth_success(principal: &Principal) -> Self {
        Self::Auth {
            status: AuthStatus::Success,
            user_id: Some(principal.user_id),
            username: Some(principal.username.clone()),
            message: None,
        }
    }

    /// Failed authentication.
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::Auth {
            status: AuthStatus::Error,
            user_id: None,
            username: None,
            message: Some(reason.into()),
        }
    }

    /// Error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Render in `dialect`.
    pub fn render(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::Json => self.to_json(),
            Dialect::Legacy => self.to_legacy(),
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            warn!(error = %e, "failed to serialize server message");
            r#"{"type":"error","message":"Internal error"}"#.to_owned()
        })
    }

    fn to_legacy(&self) -> String {
        match self {
            Self::Auth {
                status: AuthStatus::Success,
                user_id,
                username,
                ..
            } => format!(
                "AUTH_SUCCESS:{}:{}",
                user_id.unwrap_or_default(),
                username.as_deref().unwrap_or_default()
            ),
            Self::Auth { message, .. } => {
                format!("AUTH_FAILED:{}", message.as_deref().unwrap_or("Invalid token"))
            }
            Self::ChatJoined {
                chat_id,
                chat_name,
                chat_type,
            } => format!("JOINED_CHAT:{chat_id}:{chat_name}:{chat_type}"),
            Self::NewMessage {
                message_id,
                sender_id,
                sender_name,
                text,
                time,
                ..
            } => format!(
                "NEW_MESSAGE:{sender_id}:{sender_name}:{text}:{message_id}:{}",
                legacy_time(time)
            ),
            Self::MessageSent { message_id } => format!("MESSAGE_SENT:{message_id}"),
            Self::Chats { chats } => {
                let mut out = String::from("CHATS:");
                for c in chats {
                    let _ = write!(
                        out,
                        "{}:{}:{}:{}:{}:{}|",
                        c.chat_id,
                        c.chat_name,
                        c.chat_type,
                        c.last_message.as_deref().unwrap_or_default(),
                        c.last_message_time.as_ref().map(legacy_time).unwrap_or_default(),
                        c.unread_count
                    );
                }
                out
            }
            Self::Messages { chat_id, messages } => {
                let mut out = format!("MESSAGES:{chat_id}:");
                for m in messages {
                    let _ = write!(
                        out,
                        "{}:{}:{}:{}:{}:{}|",
                        m.message_id,
                        m.sender_id,
                        m.sender_name,
                        m.text,
                        legacy_time(&m.time),
                        m.is_own
                    );
                }
                out
            }
            Self::Pong => "PONG".to_owned(),
            Self::Error { message } => format!("ERROR: {message}"),
        }
    }
}

/// `2024-05-01 12:30:00.123`, the timestamp shape legacy clients parse.
fn legacy_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
