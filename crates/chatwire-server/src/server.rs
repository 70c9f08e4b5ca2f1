//! `ChatServer`: listening socket, accept loop, and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chatwire_auth::TokenValidator;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chat::{ChatProcessor, ChatStore, MessageProcessor};
use crate::config::ServerConfig;
use crate::dispatch::{DispatchContext, handle_connection};
use crate::errors::ServerError;
use crate::handler::{ApiHandler, RequestHandler};
use crate::metrics::TCP_ACCEPT_ERRORS_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broadcast::BroadcastEngine;
use crate::websocket::handshake::OriginPolicy;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::SessionContext;

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// The chat server.
pub struct ChatServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    broadcast: Arc<BroadcastEngine>,
    validator: Arc<dyn TokenValidator>,
    processor: Arc<dyn MessageProcessor>,
    handler: Option<Arc<dyn RequestHandler>>,
    metrics: Option<PrometheusHandle>,
    shutdown: ShutdownCoordinator,
}

impl ChatServer {
    /// Server running the chat application over `store`, authenticating
    /// with `validator`.
    pub fn new(
        config: ServerConfig,
        validator: Arc<dyn TokenValidator>,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcast = Arc::new(BroadcastEngine::new(Arc::clone(&registry)));
        let processor = Arc::new(ChatProcessor::new(
            store,
            Arc::clone(&validator),
            Arc::clone(&broadcast),
        ));
        Self {
            config,
            registry,
            broadcast,
            validator,
            processor,
            handler: None,
            metrics: None,
            shutdown: ShutdownCoordinator::new(),
        }
    }

    /// Replace the message processor.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Replace the handler for non-upgrade requests.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Serve `/metrics` from `handle` (built-in handler only).
    #[must_use]
    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Bind and start accepting. Returns the bound address and the accept
    /// loop's handle, which finishes once shutdown begins.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "chat server listening");

        let ctx = Arc::new(self.dispatch_context());
        let token = self.shutdown.token();
        let tracker = self.shutdown.tracker().clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        info!("accept loop stopping");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                            }
                            let _ = tracker.spawn(handle_connection(stream, peer, Arc::clone(&ctx)));
                        }
                        Err(e) => {
                            counter!(TCP_ACCEPT_ERRORS_TOTAL).increment(1);
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    },
                }
            }
        });
        Ok((addr, handle))
    }

    /// Stop accepting, tell every session to close, and wait up to
    /// `timeout` for connection tasks. Connections still registered
    /// afterwards are force-closed. Returns `false` if the wait timed out.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> bool {
        info!(connections = self.registry.len(), "shutting down");
        let drained = self.shutdown.graceful_shutdown(timeout).await;
        let forced = self.registry.close_all();
        if forced > 0 {
            warn!(forced, "force-closed remaining connections");
        }
        drained
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Topic broadcaster over [`registry`](Self::registry).
    pub fn broadcast(&self) -> &Arc<BroadcastEngine> {
        &self.broadcast
    }

    /// Configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shutdown signal and task tracker.
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    fn dispatch_context(&self) -> DispatchContext {
        let origins = OriginPolicy::new(self.config.allowed_origins.iter().cloned());
        let handler: Arc<dyn RequestHandler> = match (&self.handler, &self.metrics) {
            (Some(custom), _) => Arc::clone(custom),
            (None, metrics) => {
                let api = ApiHandler::new(
                    Arc::clone(&self.registry),
                    Arc::clone(&self.validator),
                    origins.clone(),
                );
                Arc::new(match metrics {
                    Some(handle) => api.with_metrics(handle.clone()),
                    None => api,
                })
            }
        };
        DispatchContext {
            read_chunk_size: self.config.read_chunk_size,
            max_request_size: self.config.max_request_size,
            origins,
            handler,
            session: Arc::new(SessionContext {
                registry: Arc::clone(&self.registry),
                processor: Arc::clone(&self.processor),
                validator: Arc::clone(&self.validator),
                shutdown: self.shutdown.token(),
                read_chunk_size: self.config.ws_read_chunk_size,
                max_frame_size: self.config.max_frame_size,
                queue_capacity: self.config.outbound_queue_capacity,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use chatwire_auth::InMemoryTokenStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::chat::InMemoryChatStore;
    use crate::http::HttpResponse;

    fn make_server() -> ChatServer {
        ChatServer::new(
            ServerConfig::default(),
            Arc::new(InMemoryTokenStore::new(Duration::from_secs(60))),
            Arc::new(InMemoryChatStore::new()),
        )
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut out = String::new();
        let _ = stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[test]
    fn accessors() {
        let server = make_server();
        assert_eq!(server.config().port, 0);
        assert!(server.registry().is_empty());
        assert!(Arc::ptr_eq(server.broadcast().registry(), server.registry()));
        assert!(!server.shutdown_coordinator().is_shutting_down());
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port() {
        let server = make_server();
        let (addr, _handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.shutdown(Some(Duration::from_secs(1))).await);
    }

    #[tokio::test]
    async fn serves_health() {
        let server = make_server();
        let (addr, _handle) = server.listen().await.unwrap();
        let resp = get(addr, "/health").await;
        assert!(resp.starts_with("HTTP/1.1 200 OK"), "{resp}");
        assert!(resp.contains(r#""status":"ok""#));
        let _ = server.shutdown(Some(Duration::from_secs(1))).await;
    }

    #[tokio::test]
    async fn custom_handler_replaces_routes() {
        struct Teapot;

        #[async_trait::async_trait]
        impl RequestHandler for Teapot {
            async fn handle(&self, _: crate::http::HttpRequest) -> Result<HttpResponse, ServerError> {
                Ok(HttpResponse::text(200, "short and stout"))
            }
        }

        let server = make_server().with_handler(Arc::new(Teapot));
        let (addr, _handle) = server.listen().await.unwrap();
        assert!(get(addr, "/health").await.ends_with("short and stout"));
        let _ = server.shutdown(Some(Duration::from_secs(1))).await;
    }

    #[tokio::test]
    async fn shutdown_stops_accept_loop() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert!(server.shutdown(Some(Duration::from_secs(1))).await);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("accept loop exits")
            .unwrap();
        assert!(server.shutdown_coordinator().is_shutting_down());
        // The listener is dropped with the loop.
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn bind_failure_is_io_error() {
        let first = make_server();
        let (addr, _handle) = first.listen().await.unwrap();
        let second = ChatServer::new(
            ServerConfig::default().with_bind("127.0.0.1", addr.port()),
            Arc::new(InMemoryTokenStore::new(Duration::from_secs(60))),
            Arc::new(InMemoryChatStore::new()),
        );
        assert!(matches!(second.listen().await, Err(ServerError::Io(_))));
        let _ = first.shutdown(Some(Duration::from_secs(1))).await;
    }
}
