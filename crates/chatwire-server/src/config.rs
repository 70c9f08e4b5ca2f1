//! Server configuration.

use chatwire_settings::ServerSettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for [`ChatServer`](crate::ChatServer).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Bytes requested per socket read while framing an HTTP request.
    pub read_chunk_size: usize,
    /// Upper bound on head + body bytes for one HTTP request.
    pub max_request_size: usize,
    /// Bytes requested per socket read on an open WebSocket.
    pub ws_read_chunk_size: usize,
    /// Largest accepted WebSocket frame payload.
    pub max_frame_size: usize,
    /// Outbound frames queued per connection.
    pub outbound_queue_capacity: usize,
    /// Origins allowed to upgrade.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default()).with_bind("127.0.0.1", 0)
    }
}

impl ServerConfig {
    /// Replace host and port.
    #[must_use]
    pub fn with_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Replace the origin allow-list.
    #[must_use]
    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            read_chunk_size: s.read_chunk_size,
            max_request_size: s.max_request_size,
            ws_read_chunk_size: s.ws_read_chunk_size,
            max_frame_size: s.max_frame_size,
            outbound_queue_capacity: s.outbound_queue_capacity,
            allowed_origins: s.allowed_origins.clone(),
        }
    }
}
