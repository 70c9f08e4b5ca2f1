//! The chat application layered on WebSocket sessions.

pub mod processor;
pub mod protocol;
pub mod store;

pub use processor::{ChatProcessor, MessageProcessor};
pub use protocol::{ClientMessage, Dialect, ProtocolError, ServerMessage};
pub use store::{ChatStore, InMemoryChatStore, Seed, StoreError};
