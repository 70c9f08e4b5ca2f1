//! # chatwire-core
//!
//! Foundation types shared by every chatwire crate:
//!
//! - **Branded IDs**: [`ConnectionId`] as a newtype so connection identity is never
//!   confused with user or chat identifiers
//! - **Chat vocabulary**: [`Principal`], [`Topic`], and the records exchanged with
//!   the chat store ([`ChatInfo`], [`ChatSummary`], [`ChatMessage`], [`StoredMessage`])
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod chat;
pub mod ids;
pub mod logging;

pub use chat::{ChatId, ChatInfo, ChatMessage, ChatSummary, Principal, StoredMessage, Topic, UserId};
pub use ids::ConnectionId;
