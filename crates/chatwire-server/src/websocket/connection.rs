//! WebSocket client connection state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chatwire_core::ConnectionId;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::frame::{Frame, encode_frame};
use super::state::{ConnectionState, Session};

/// A connected WebSocket client.
///
/// Outbound frames go through a bounded channel drained by the
/// connection's writer task, so any task may send without touching the
/// socket. The [`Session`] is written only by the connection's own read
/// loop; other tasks (broadcast) take snapshots.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Remote address.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: Instant,
    tx: mpsc::Sender<Bytes>,
    session: RwLock<Session>,
    state: Mutex<ConnectionState>,
    closed: CancellationToken,
    dropped_frames: AtomicU64,
}

impl ClientConnection {
    /// Create a connection in [`ConnectionState::AwaitingHandshake`].
    pub fn new(id: ConnectionId, peer: SocketAddr, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            peer,
            connected_at: Instant::now(),
            tx,
            session: RwLock::new(Session::new()),
            state: Mutex::new(ConnectionState::AwaitingHandshake),
            closed: CancellationToken::new(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move from `AwaitingHandshake` to `Open`. Returns `false` if the
    /// connection was in any other state.
    pub fn mark_open(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::AwaitingHandshake {
            *state = ConnectionState::Open;
            true
        } else {
            false
        }
    }

    /// Whether frames may be sent.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Move to `Closed` and wake everything waiting on [`closed`](Self::closed).
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        drop(state);
        self.closed.cancel();
        true
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    // ── Session ─────────────────────────────────────────────────────

    /// Snapshot of the session.
    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    /// Replace the session.
    pub fn set_session(&self, session: Session) {
        *self.session.write() = session;
    }

    /// Evaluate `f` against the session without cloning it.
    pub fn with_session<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        f(&self.session.read())
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Queue encoded frame bytes for the writer task.
    ///
    /// Returns `false` (and counts a drop) if the connection is not open,
    /// the queue is full, or the writer has gone away.
    pub fn send(&self, bytes: Bytes) -> bool {
        if self.state() == ConnectionState::Closed {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.tx.try_send(bytes).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Encode and queue a frame.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        self.send(encode_frame(frame))
    }

    /// Queue a text frame.
    pub fn send_text(&self, text: &str) -> bool {
        self.send_frame(&Frame::text(text))
    }

    /// Frames dropped so far.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
