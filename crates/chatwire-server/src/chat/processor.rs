//! Per-message business logic for WebSocket sessions.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chatwire_auth::TokenValidator;
use chatwire_core::{ChatId, Principal, Topic};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use super::protocol::{self, ClientMessage, Dialect, ServerMessage};
use super::store::{ChatStore, StoreError};
use crate::metrics::{CHAT_MESSAGE_DURATION_SECONDS, CHAT_MESSAGES_TOTAL};
use crate::websocket::broadcast::BroadcastEngine;
use crate::websocket::connection::ClientConnection;
use crate::websocket::state::Session;

/// Handles one decoded text frame.
///
/// May mutate `session` and broadcast as a side effect. The returned text,
/// if any, is sent back to the sender only.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Process `raw` from `conn`.
    async fn process(&self, conn: &ClientConnection, raw: &str, session: &mut Session) -> Option<String>;
}

/// The chat application: authentication, chat membership, posting and
/// history, over a [`ChatStore`].
pub struct ChatProcessor {
    store: Arc<dyn ChatStore>,
    validator: Arc<dyn TokenValidator>,
    broadcast: Arc<BroadcastEngine>,
}

impl ChatProcessor {
    /// Processor over the given collaborators.
    pub fn new(
        store: Arc<dyn ChatStore>,
        validator: Arc<dyn TokenValidator>,
        broadcast: Arc<BroadcastEngine>,
    ) -> Self {
        Self {
            store,
            validator,
            broadcast,
        }
    }

    async fn handle(
        &self,
        conn: &ClientConnection,
        msg: ClientMessage,
        dialect: Dialect,
        session: &mut Session,
    ) -> ServerMessage {
        let result = match (msg, session.principal()) {
            (ClientMessage::Ping, _) => Ok(ServerMessage::Pong),
            (ClientMessage::Auth { token }, _) => Ok(self.authenticate(conn, &token, session)),
            (_, None) => Ok(ServerMessage::error("Not authenticated")),
            (ClientMessage::JoinChat { chat_id }, Some(principal)) => {
                self.join_chat(&principal, chat_id, session).await
            }
            (ClientMessage::SendMessage { chat_id, text }, Some(principal)) => {
                match chat_id.or_else(|| session.current_topic.as_ref().and_then(Topic::chat_id)) {
                    Some(chat_id) => self.send_message(&principal, chat_id, text, dialect).await,
                    None => Ok(ServerMessage::error("Not in any chat")),
                }
            }
            (ClientMessage::GetChats, Some(principal)) => self
                .store
                .chats_for_user(principal.user_id)
                .await
                .map(|chats| ServerMessage::Chats { chats }),
            (ClientMessage::GetMessages { chat_id }, Some(principal)) => {
                self.get_messages(&principal, chat_id).await
            }
        };

        result.unwrap_or_else(|e| {
            warn!(conn_id = %conn.id, error = %e, "chat store query failed");
            ServerMessage::error("Database error")
        })
    }

    fn authenticate(&self, conn: &ClientConnection, token: &str, session: &mut Session) -> ServerMessage {
        match self.validator.validate(token) {
            Some(principal) => {
                session.authenticate(&principal);
                info!(conn_id = %conn.id, user_id = principal.user_id, "session authenticated");
                ServerMessage::auth_success(&principal)
            }
            None => {
                debug!(conn_id = %conn.id, "token rejected");
                ServerMessage::auth_failed("Invalid token")
            }
        }
    }

    async fn join_chat(
        &self,
        principal: &Principal,
        chat_id: ChatId,
        session: &mut Session,
    ) -> Result<ServerMessage, StoreError> {
        if !self.store.is_member(chat_id, principal.user_id).await? {
            return Ok(ServerMessage::error("Access denied to chat"));
        }
        let Some(info) = self.store.chat_info(chat_id).await? else {
            return Ok(ServerMessage::error("Chat not found"));
        };
        session.join(Topic::chat(chat_id));
        Ok(ServerMessage::ChatJoined {
            chat_id,
            chat_name: info.chat_name,
            chat_type: info.chat_type,
        })
    }

    async fn send_message(
        &self,
        principal: &Principal,
        chat_id: ChatId,
        text: String,
        dialect: Dialect,
    ) -> Result<ServerMessage, StoreError> {
        if !self.store.is_member(chat_id, principal.user_id).await? {
            return Ok(ServerMessage::error("Access denied to chat"));
        }
        let stored = self.store.insert_message(chat_id, principal.user_id, &text).await?;
        let sender_name = self
            .store
            .username(principal.user_id)
            .await?
            .unwrap_or_else(|| principal.username.clone());

        let announcement = ServerMessage::NewMessage {
            message_id: stored.message_id,
            chat_id,
            sender_id: principal.user_id,
            sender_name,
            text,
            time: stored.sent_at,
        };
        let recipients = self
            .broadcast
            .broadcast_to_topic(&Topic::chat(chat_id), &announcement.render(dialect));
        debug!(chat_id, message_id = stored.message_id, recipients, "message posted");

        Ok(ServerMessage::MessageSent {
            message_id: stored.message_id,
        })
    }

    async fn get_messages(&self, principal: &Principal, chat_id: ChatId) -> Result<ServerMessage, StoreError> {
        if !self.store.is_member(chat_id, principal.user_id).await? {
            return Ok(ServerMessage::error("Access denied to chat"));
        }
        let messages = self.store.messages_for_chat(chat_id, principal.user_id).await?;
        Ok(ServerMessage::Messages { chat_id, messages })
    }
}

#[async_trait]
impl MessageProcessor for ChatProcessor {
    async fn process(&self, conn: &ClientConnection, raw: &str, session: &mut Session) -> Option<String> {
        let started = Instant::now();
        let (dialect, decoded) = protocol::decode(raw);
        let reply = match decoded {
            Ok(msg) => {
                counter!(CHAT_MESSAGES_TOTAL, "kind" => msg.kind()).increment(1);
                self.handle(conn, msg, dialect, session).await
            }
            Err(e) => {
                counter!(CHAT_MESSAGES_TOTAL, "kind" => "invalid").increment(1);
                debug!(conn_id = %conn.id, error = %e, "undecodable chat message");
                ServerMessage::error(e.to_string())
            }
        };
        histogram!(CHAT_MESSAGE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Some(reply.render(dialect))
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use chatwire_auth::InMemoryTokenStore;
    use chatwire_core::{ChatInfo, ChatMessage, ChatSummary, StoredMessage, UserId};
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::chat::store::InMemoryChatStore;
    use crate::websocket::connection::test_support::open_connection;
    use crate::websocket::frame::FrameCodec;
    use crate::websocket::registry::ConnectionRegistry;

    struct Fixture {
        processor: ChatProcessor,
        registry: Arc<ConnectionRegistry>,
        tokens: Arc<InMemoryTokenStore>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryChatStore::new();
        store.add_user(1, "alice");
        store.add_user(2, "bob");
        store.add_user(3, "carol");
        store.add_chat(
            ChatInfo {
                chat_id: 7,
                chat_name: "General".into(),
                chat_type: "group".into(),
            },
            [1, 2],
        );
        let registry = Arc::new(ConnectionRegistry::new());
        let tokens = Arc::new(InMemoryTokenStore::new(std::time::Duration::from_secs(60)));
        let processor = ChatProcessor::new(
            Arc::new(store),
            Arc::clone(&tokens) as Arc<dyn TokenValidator>,
            Arc::new(BroadcastEngine::new(Arc::clone(&registry))),
        );
        Fixture {
            processor,
            registry,
            tokens,
        }
    }

    fn json(reply: Option<String>) -> Value {
        serde_json::from_str(&reply.unwrap()).unwrap()
    }

    fn text_of(bytes: &Bytes) -> String {
        let mut buf = BytesMut::from(&bytes[..]);
        FrameCodec::client(1 << 20)
            .decode(&mut buf)
            .unwrap()
            .unwrap()
            .into_text()
            .unwrap()
    }

    fn member(fx: &Fixture, id: &str, user: UserId, chat: ChatId) -> mpsc::Receiver<Bytes> {
        let (conn, rx) = open_connection(id, 8);
        let mut session = Session::authenticated_as(&Principal::new(user, id));
        session.join(Topic::chat(chat));
        conn.set_session(session);
        fx.registry.insert(conn);
        rx
    }

    #[tokio::test]
    async fn json_auth_success_and_failure() {
        let fx = fixture();
        let (conn, _rx) = open_connection("c", 4);
        let token = fx.tokens.issue(&Principal::new(1, "alice"));
        let mut session = Session::new();

        let bad = json(fx.processor.process(&conn, r#"{"type":"auth","token":"nope"}"#, &mut session).await);
        assert_eq!(bad["status"], "error");
        assert_eq!(bad["message"], "Invalid token");
        assert!(!session.authenticated);

        let raw = format!(r#"{{"type":"auth","token":"{token}"}}"#);
        let ok = json(fx.processor.process(&conn, &raw, &mut session).await);
        assert_eq!(ok["type"], "auth");
        assert_eq!(ok["status"], "success");
        assert_eq!(ok["user_id"], 1);
        assert_eq!(session.principal(), Some(Principal::new(1, "alice")));
    }

    #[tokio::test]
    async fn legacy_auth() {
        let fx = fixture();
        let (conn, _rx) = open_connection("c", 4);
        let token = fx.tokens.issue(&Principal::new(2, "bob"));
        let mut session = Session::new();
        assert_eq!(
            fx.processor.process(&conn, "AUTH:bad", &mut session).await.as_deref(),
            Some("AUTH_FAILED:Invalid token")
        );
        assert_eq!(
            fx.processor
                .process(&conn, &format!("AUTH:{token}"), &mut session)
                .await
                .as_deref(),
            Some("AUTH_SUCCESS:2:bob")
        );
    }

    #[tokio::test]
    async fn unauthenticated_requests_are_refused_but_ping_works() {
        let fx = fixture();
        let (conn, _rx) = open_connection("c", 4);
        let mut session = Session::new();
        let reply = json(fx.processor.process(&conn, r#"{"type":"join_chat","chat_id":7}"#, &mut session).await);
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Not authenticated");
        assert_eq!(
            fx.processor.process(&conn, "GET_CHATS", &mut session).await.as_deref(),
            Some("ERROR: Not authenticated")
        );
        assert_eq!(
            fx.processor.process(&conn, "PING", &mut session).await.as_deref(),
            Some("PONG")
        );
    }

    #[tokio::test]
    async fn join_chat_requires_membership() {
        let fx = fixture();
        let (conn, _rx) = open_connection("c", 4);
        let mut outsider = Session::authenticated_as(&Principal::new(3, "carol"));
        let denied = json(fx.processor.process(&conn, r#"{"type":"join_chat","chat_id":7}"#, &mut outsider).await);
        assert_eq!(denied["message"], "Access denied to chat");
        assert!(outsider.current_topic.is_none());

        let mut alice = Session::authenticated_as(&Principal::new(1, "alice"));
        let joined = json(fx.processor.process(&conn, r#"{"type":"join_chat","chat_id":"7"}"#, &mut alice).await);
        assert_eq!(joined["type"], "chat_joined");
        assert_eq!(joined["chat_id"], 7);
        assert_eq!(joined["chat_name"], "General");
        assert_eq!(joined["chat_type"], "group");
        assert_eq!(alice.current_topic, Some(Topic::chat(7)));

        assert_eq!(
            fx.processor.process(&conn, "JOIN_CHAT:7", &mut alice).await.as_deref(),
            Some("JOINED_CHAT:7:General:group")
        );
    }

    #[tokio::test]
    async fn json_message_broadcasts_to_topic_and_acks_sender() {
        let fx = fixture();
        let mut bob_rx = member(&fx, "bob", 2, 7);
        let mut elsewhere_rx = member(&fx, "other", 2, 8);
        let (conn, _rx) = open_connection("alice", 4);
        let mut alice = Session::authenticated_as(&Principal::new(1, "alice"));

        let ack = json(
            fx.processor
                .process(&conn, r#"{"type":"message","chat_id":7,"text":"hi"}"#, &mut alice)
                .await,
        );
        assert_eq!(ack["type"], "message_sent");
        assert!(ack["message_id"].as_i64().unwrap() > 0);

        let pushed: Value = serde_json::from_str(&text_of(&bob_rx.try_recv().unwrap())).unwrap();
        assert_eq!(pushed["type"], "new_message");
        assert_eq!(pushed["chat_id"], 7);
        assert_eq!(pushed["sender_id"], 1);
        assert_eq!(pushed["sender_name"], "alice");
        assert_eq!(pushed["text"], "hi");
        assert_eq!(pushed["message_id"], ack["message_id"]);
        assert!(elsewhere_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn legacy_message_uses_current_chat() {
        let fx = fixture();
        let mut bob_rx = member(&fx, "bob", 2, 7);
        let (conn, _rx) = open_connection("alice", 4);
        let mut alice = Session::authenticated_as(&Principal::new(1, "alice"));

        assert_eq!(
            fx.processor.process(&conn, "MESSAGE:hello", &mut alice).await.as_deref(),
            Some("ERROR: Not in any chat")
        );

        let _ = fx.processor.process(&conn, "JOIN_CHAT:7", &mut alice).await;
        let reply = fx.processor.process(&conn, "MESSAGE:hello", &mut alice).await.unwrap();
        assert!(reply.starts_with("MESSAGE_SENT:"), "{reply}");

        let pushed = text_of(&bob_rx.try_recv().unwrap());
        assert!(pushed.starts_with("NEW_MESSAGE:1:alice:hello:"), "{pushed}");
    }

    #[tokio::test]
    async fn message_to_foreign_chat_is_denied() {
        let fx = fixture();
        let (conn, _rx) = open_connection("carol", 4);
        let mut carol = Session::authenticated_as(&Principal::new(3, "carol"));
        let reply = json(
            fx.processor
                .process(&conn, r#"{"type":"message","chat_id":7,"text":"sneaky"}"#, &mut carol)
                .await,
        );
        assert_eq!(reply["message"], "Access denied to chat");
    }

    #[tokio::test]
    async fn history_and_chat_list() {
        let fx = fixture();
        let (conn, _rx) = open_connection("alice", 4);
        let mut alice = Session::authenticated_as(&Principal::new(1, "alice"));
        let _ = fx
            .processor
            .process(&conn, r#"{"type":"message","chat_id":7,"text":"first"}"#, &mut alice)
            .await;

        let history = json(
            fx.processor
                .process(&conn, r#"{"type":"get_messages","chat_id":7}"#, &mut alice)
                .await,
        );
        assert_eq!(history["type"], "messages");
        assert_eq!(history["messages"][0]["text"], "first");
        assert_eq!(history["messages"][0]["is_own"], true);

        let chats = json(fx.processor.process(&conn, r#"{"type":"get_chats"}"#, &mut alice).await);
        assert_eq!(chats["type"], "chats");
        assert_eq!(chats["chats"][0]["chat_id"], 7);
        assert_eq!(chats["chats"][0]["last_message"], "first");

        let legacy = fx.processor.process(&conn, "GET_CHATS", &mut alice).await.unwrap();
        assert!(legacy.starts_with("CHATS:7:General:group:first:"), "{legacy}");
        assert!(legacy.ends_with(":0|"), "{legacy}");
    }

    #[tokio::test]
    async fn decode_errors_are_replied_in_dialect() {
        let fx = fixture();
        let (conn, _rx) = open_connection("c", 4);
        let mut session = Session::new();
        let reply = json(fx.processor.process(&conn, "{oops", &mut session).await);
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Invalid JSON format");
        let reply = json(fx.processor.process(&conn, r#"{"type":"nope"}"#, &mut session).await);
        assert_eq!(reply["message"], "Unknown message type");
        assert_eq!(
            fx.processor.process(&conn, "WHAT", &mut session).await.as_deref(),
            Some("ERROR: Unknown message format")
        );
    }

    struct BrokenStore;

    #[async_trait]
    impl ChatStore for BrokenStore {
        async fn is_member(&self, _: ChatId, _: UserId) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn chat_info(&self, _: ChatId) -> Result<Option<ChatInfo>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn insert_message(&self, _: ChatId, _: UserId, _: &str) -> Result<StoredMessage, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn username(&self, _: UserId) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn chats_for_user(&self, _: UserId) -> Result<Vec<ChatSummary>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn messages_for_chat(&self, _: ChatId, _: UserId) -> Result<Vec<ChatMessage>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_failures_become_database_error() {
        let processor = ChatProcessor::new(
            Arc::new(BrokenStore),
            Arc::new(InMemoryTokenStore::new(std::time::Duration::from_secs(60))),
            Arc::new(BroadcastEngine::new(Arc::new(ConnectionRegistry::new()))),
        );
        let (conn, _rx) = open_connection("c", 4);
        let mut session = Session::authenticated_as(&Principal::new(1, "alice"));
        let reply = json(processor.process(&conn, r#"{"type":"join_chat","chat_id":7}"#, &mut session).await);
        assert_eq!(reply["message"], "Database error");
        assert_eq!(
            processor.process(&conn, "GET_CHATS", &mut session).await.as_deref(),
            Some("ERROR: Database error")
        );
    }
}
