//! Concurrent registry of live WebSocket connections.

use std::sync::Arc;

use chatwire_core::ConnectionId;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tracing::{debug, info};

use super::connection::ClientConnection;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_DISCONNECTIONS_TOTAL};

/// Map from connection ID to connection.
///
/// Sharded, so inserts and removals on one connection do not block
/// broadcast iteration over others.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    pub fn insert(&self, conn: Arc<ClientConnection>) {
        debug!(conn_id = %conn.id, "registering connection");
        if self.connections.insert(conn.id.clone(), conn).is_none() {
            gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        }
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove and close a connection.
    ///
    /// Idempotent: the read loop and a failing broadcast may both call this
    /// for the same connection; only the first call has any effect. Returns
    /// whether this call removed it.
    pub fn cleanup(&self, id: &ConnectionId) -> bool {
        let Some((_, conn)) = self.connections.remove(id) else {
            return false;
        };
        let _ = conn.close();
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        info!(
            conn_id = %id,
            peer = %conn.peer,
            age_ms = u64::try_from(conn.age().as_millis()).unwrap_or(u64::MAX),
            "connection cleaned up"
        );
        true
    }

    /// Point-in-time copy of every registered connection.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of registered connections with an authenticated session.
    pub fn authenticated_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().with_session(|s| s.authenticated))
            .count()
    }

    /// Clean up every connection. Returns how many were removed.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cleanup(id)).count()
    }
}
