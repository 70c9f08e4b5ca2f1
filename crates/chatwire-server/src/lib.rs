//! # chatwire-server
//!
//! A chat server that terminates plain HTTP/1.1 requests and upgraded
//! WebSocket connections on one listening socket.
//!
//! - [`server`]: accept loop and lifecycle
//! - [`http`]: request framer and response serialization
//! - [`websocket`]: frame codec, handshake, connection registry, broadcast
//! - [`chat`]: message decoding, the message processor, the chat store
//! - [`handler`]: the request handler invoked for non-upgrade requests

#![deny(unsafe_code)]

pub mod chat;
pub mod config;
mod dispatch;
pub mod errors;
pub mod handler;
pub mod health;
pub mod http;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use server::ChatServer;
