//! WebSocket transport: frame codec, opening handshake, connection registry,
//! topic broadcast, and the per-connection session loop.

pub mod broadcast;
pub mod connection;
pub mod frame;
pub mod handshake;
pub mod registry;
pub mod session;
pub mod state;

pub use broadcast::BroadcastEngine;
pub use connection::ClientConnection;
pub use frame::{Frame, FrameCodec, Opcode, apply_mask, encode_frame};
pub use handshake::{Handshake, OriginPolicy, compute_accept_key, extract_credential, is_upgrade_request};
pub use registry::ConnectionRegistry;
pub use session::{SessionContext, run_ws_session};
pub use state::{ConnectionState, Session};
