//! Topic-filtered fan-out over the connection registry.

use std::sync::Arc;

use chatwire_core::Topic;
use metrics::counter;
use tracing::{debug, warn};

use super::frame::{Frame, encode_frame};
use super::registry::ConnectionRegistry;
use crate::metrics::{WS_BROADCAST_DROPS_TOTAL, WS_BROADCAST_RECIPIENTS_TOTAL};

/// Delivers a message to every authenticated connection whose current topic
/// matches.
pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastEngine {
    /// Engine over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this engine fans out over.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Send `message` as a text frame to every eligible connection.
    ///
    /// The frame is encoded once. A recipient whose send fails is cleaned up
    /// and delivery continues with the rest. Returns the number of
    /// connections the frame was queued for.
    pub fn broadcast_to_topic(&self, topic: &Topic, message: &str) -> usize {
        let frame = encode_frame(&Frame::text(message));
        let mut delivered = 0;
        let mut dropped = 0;

        for conn in self.registry.snapshot() {
            if !conn.is_open() || !conn.with_session(|s| s.receives(topic)) {
                continue;
            }
            if conn.send(frame.clone()) {
                delivered += 1;
            } else {
                dropped += 1;
                warn!(conn_id = %conn.id, %topic, "broadcast send failed, cleaning up recipient");
                let _ = self.registry.cleanup(&conn.id);
            }
        }

        counter!(WS_BROADCAST_RECIPIENTS_TOTAL).increment(delivered as u64);
        if dropped > 0 {
            counter!(WS_BROADCAST_DROPS_TOTAL).increment(dropped);
        }
        debug!(%topic, recipients = delivered, dropped, "broadcast to topic");
        delivered
    }
}
