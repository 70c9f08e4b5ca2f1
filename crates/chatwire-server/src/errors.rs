//! Server error types.
//!
//! Framing and handshake failures are fatal to their connection; the
//! dispatcher writes the [`ServerError::status`] response (when there is
//! one) and closes. Frame decode failures close without a response.

use thiserror::Error;

/// Errors raised while serving one connection.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed start line, unsupported method, or unterminated head.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The request grew past the configured maximum.
    #[error("request exceeds {limit} bytes")]
    SizeLimitExceeded {
        /// The configured maximum.
        limit: usize,
    },

    /// `Origin` was present but not allow-listed.
    #[error("origin not allowed: {0}")]
    OriginRejected(String),

    /// Upgrade intent without the headers needed to complete it.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A WebSocket frame could not be decoded.
    #[error("frame decode error: {0}")]
    FrameDecode(#[from] FrameError),

    /// The request handler failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// HTTP status to answer with before closing, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Protocol(_) | Self::Handshake(_) => Some(400),
            Self::SizeLimitExceeded { .. } => Some(413),
            Self::OriginRejected(_) => Some(403),
            Self::Handler(_) => Some(500),
            Self::FrameDecode(_) | Self::Io(_) => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::SizeLimitExceeded { .. } => "size_limit",
            Self::OriginRejected(_) => "origin_rejected",
            Self::Handshake(_) => "handshake",
            Self::FrameDecode(_) => "frame_decode",
            Self::Handler(_) => "handler",
            Self::Io(_) => "io",
        }
    }
}

/// Errors from the WebSocket frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Declared payload length exceeds the configured maximum.
    #[error("frame payload of {len} bytes exceeds limit of {limit}")]
    TooLong {
        /// Declared length.
        len: u64,
        /// Configured maximum.
        limit: usize,
    },

    /// A client frame arrived without a mask.
    #[error("client frame is not masked")]
    Unmasked,

    /// RSV bits set without a negotiated extension.
    #[error("reserved bits set: {0:#04x}")]
    ReservedBits(u8),

    /// Opcode in the reserved ranges.
    #[error("reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame that is fragmented or longer than 125 bytes.
    #[error("invalid control frame: {0}")]
    BadControlFrame(&'static str),

    /// Text payload is not UTF-8.
    #[error("text frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Underlying I/O error surfaced through the codec.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
