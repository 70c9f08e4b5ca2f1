//! Per-connection session data and lifecycle state.

use chatwire_core::{Principal, Topic, UserId};

/// Mutable per-connection state, owned by the connection's task.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    /// Whether a credential has been accepted.
    pub authenticated: bool,
    /// Authenticated user.
    pub principal_id: Option<UserId>,
    /// Authenticated user's display name.
    pub username: Option<String>,
    /// Topic this connection receives broadcasts for.
    pub current_topic: Option<Topic>,
}

impl Session {
    /// Fresh, unauthenticated session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Session that starts authenticated as `principal`.
    pub fn authenticated_as(principal: &Principal) -> Self {
        let mut session = Self::new();
        session.authenticate(principal);
        session
    }

    /// Record a successful authentication.
    pub fn authenticate(&mut self, principal: &Principal) {
        self.authenticated = true;
        self.principal_id = Some(principal.user_id);
        self.username = Some(principal.username.clone());
    }

    /// Switch the broadcast topic.
    pub fn join(&mut self, topic: Topic) {
        self.current_topic = Some(topic);
    }

    /// The authenticated identity, if any.
    pub fn principal(&self) -> Option<Principal> {
        match (self.authenticated, self.principal_id, &self.username) {
            (true, Some(id), Some(name)) => Some(Principal::new(id, name.clone())),
            _ => None,
        }
    }

    /// Whether this session should receive a broadcast for `topic`.
    pub fn receives(&self, topic: &Topic) -> bool {
        self.authenticated && self.current_topic.as_ref() == Some(topic)
    }
}

/// Where a connection is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted; the 101 response has not been written yet.
    AwaitingHandshake,
    /// Handshake complete; frames flow both ways.
    Open,
    /// Terminal. No further frames are sent or processed.
    Closed,
}
