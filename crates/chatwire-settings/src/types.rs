//! Settings types. Serialized as camelCase JSON.

use serde::{Deserialize, Serialize};

use crate::errors::SettingsError;

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatwireSettings {
    /// Listener, framing limits, and origin policy.
    pub server: ServerSettings,
    /// Credential lifetime.
    pub auth: AuthSettings,
    /// Log level and format.
    pub logging: LoggingSettings,
}

/// Listener and wire-level limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Size of each socket read while framing an HTTP request.
    pub read_chunk_size: usize,
    /// Upper bound on bytes buffered for one HTTP request (head and body).
    pub max_request_size: usize,
    /// Size of each socket read on an open WebSocket.
    pub ws_read_chunk_size: usize,
    /// Largest accepted WebSocket frame payload.
    pub max_frame_size: usize,
    /// Outbound frames queued per connection before sends start failing.
    pub outbound_queue_capacity: usize,
    /// Origins allowed to open a WebSocket. A request without `Origin` is
    /// always allowed.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_chunk_size: 8192,
            max_request_size: 65_536,
            ws_read_chunk_size: 4096,
            max_frame_size: 1024 * 1024,
            outbound_queue_capacity: 1024,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8088".to_string(),
            ],
        }
    }
}

/// Credential settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Lifetime of issued bearer tokens, in seconds.
    pub token_ttl_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit one JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ChatwireSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        let server = &self.server;
        if server.read_chunk_size == 0 || server.ws_read_chunk_size == 0 {
            return Err(SettingsError::invalid("readChunkSize", "read chunk sizes must be positive"));
        }
        if server.max_request_size < server.read_chunk_size {
            return Err(SettingsError::invalid(
                "maxRequestSize",
                format!(
                    "{} is smaller than readChunkSize ({})",
                    server.max_request_size, server.read_chunk_size
                ),
            ));
        }
        if server.outbound_queue_capacity == 0 {
            return Err(SettingsError::invalid("outboundQueueCapacity", "must be positive"));
        }
        Ok(())
    }
}
