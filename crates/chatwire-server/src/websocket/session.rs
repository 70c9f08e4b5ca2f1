//! WebSocket session lifecycle: one upgraded client from the 101 response
//! through cleanup.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chatwire_auth::TokenValidator;
use chatwire_core::ConnectionId;
use metrics::counter;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::connection::ClientConnection;
use super::frame::{Frame, FrameCodec, Opcode};
use super::handshake::Handshake;
use super::registry::ConnectionRegistry;
use super::state::Session;
use crate::chat::MessageProcessor;
use crate::errors::ServerError;
use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_FRAME_ERRORS_TOTAL, WS_FRAMES_RECEIVED_TOTAL};

/// How long cleanup waits for the writer to flush queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Close status sent to clients when the server shuts down.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Everything a session needs besides its socket.
pub struct SessionContext {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Business logic for text frames.
    pub processor: Arc<dyn MessageProcessor>,
    /// Validates credentials carried by the upgrade request.
    pub validator: Arc<dyn TokenValidator>,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
    /// Bytes requested per socket read.
    pub read_chunk_size: usize,
    /// Largest accepted frame payload.
    pub max_frame_size: usize,
    /// Outbound frames queued per connection.
    pub queue_capacity: usize,
}

/// Run one upgraded connection.
///
/// Writes the handshake response, registers the connection, then processes
/// frames in arrival order until EOF, a Close frame, a decode error, or
/// shutdown. `buffered` holds bytes read past the upgrade request. The
/// connection is always removed from the registry before this returns.
#[instrument(skip_all, fields(conn_id = %id, peer = %peer))]
pub async fn run_ws_session<S>(
    stream: S,
    peer: SocketAddr,
    id: ConnectionId,
    mut buffered: BytesMut,
    handshake: Handshake,
    ctx: Arc<SessionContext>,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel::<Bytes>(ctx.queue_capacity.max(1));
    let conn = Arc::new(ClientConnection::new(id, peer, tx));

    if let Some(principal) = handshake
        .credential
        .as_deref()
        .and_then(|token| ctx.validator.validate(token))
    {
        info!(user_id = principal.user_id, "authenticated by upgrade credential");
        conn.set_session(Session::authenticated_as(&principal));
    }

    // Registered while still AwaitingHandshake: broadcasts skip it until open.
    ctx.registry.insert(Arc::clone(&conn));
    if let Err(e) = write_handshake(&mut writer, &handshake).await {
        let _ = ctx.registry.cleanup(&conn.id);
        return Err(e.into());
    }
    let _ = conn.mark_open();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!("websocket connected");

    let mut writer_task = tokio::spawn(write_loop(writer, rx, Arc::clone(&conn)));

    let outcome = read_loop(&mut reader, &mut buffered, &conn, &ctx).await;
    if let Err(e) = &outcome {
        if matches!(e, ServerError::FrameDecode(_)) {
            counter!(WS_FRAME_ERRORS_TOTAL).increment(1);
        }
        warn!(error = %e, "websocket session ended with error");
    }

    let _ = ctx.registry.cleanup(&conn.id);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
        warn!("writer did not drain in time, aborting");
        writer_task.abort();
        // Wait for the abort so the write half is dropped before we return.
        let _ = writer_task.await;
    }
    info!(dropped_frames = conn.drop_count(), "websocket disconnected");
    outcome
}

async fn write_handshake<W>(writer: &mut W, handshake: &Handshake) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&handshake.response()).await?;
    writer.flush().await
}

/// Process frames until the session should end.
async fn read_loop<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    conn: &ClientConnection,
    ctx: &SessionContext,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::server(ctx.max_frame_size);
    let mut chunk = vec![0_u8; ctx.read_chunk_size.max(1)];
    let mut session = conn.session();

    loop {
        while let Some(frame) = codec.decode(buf)? {
            counter!(WS_FRAMES_RECEIVED_TOTAL, "opcode" => frame.opcode.label()).increment(1);
            if handle_frame(frame, conn, ctx, &mut session).await?.is_break() {
                return Ok(());
            }
        }

        let n = tokio::select! {
            () = conn.closed() => {
                debug!("connection closed elsewhere");
                return Ok(());
            }
            () = ctx.shutdown.cancelled() => {
                let _ = conn.send_frame(&Frame::close(CLOSE_GOING_AWAY, "server shutting down"));
                return Ok(());
            }
            read = reader.read(&mut chunk) => read?,
        };
        if n == 0 {
            debug!("peer closed connection");
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        trace!(read = n, buffered = buf.len(), "read frame bytes");
    }
}

async fn handle_frame(
    frame: Frame,
    conn: &ClientConnection,
    ctx: &SessionContext,
    session: &mut Session,
) -> Result<ControlFlow<()>, ServerError> {
    match frame.opcode {
        Opcode::Text => {
            let text = frame.into_text()?;
            trace!(len = text.len(), "text frame");
            let reply = ctx.processor.process(conn, &text, session).await;
            // Publish the session so broadcasts see joins and authentication.
            conn.set_session(session.clone());
            if let Some(reply) = reply {
                if !conn.send_text(&reply) {
                    warn!("reply could not be queued, closing");
                    return Ok(ControlFlow::Break(()));
                }
            }
        }
        Opcode::Ping => {
            let _ = conn.send_frame(&Frame::pong(frame.payload));
        }
        Opcode::Pong => trace!("pong"),
        Opcode::Close => {
            let echo = match frame.close_code() {
                Some(code) => Frame::close(code, ""),
                None => Frame::new(Opcode::Close, Bytes::new()),
            };
            let _ = conn.send_frame(&echo);
            debug!(code = ?frame.close_code(), "client sent close");
            return Ok(ControlFlow::Break(()));
        }
        Opcode::Binary => debug!(len = frame.payload_len(), "ignoring binary frame"),
        Opcode::Continuation => {
            warn!(len = frame.payload_len(), "dropping continuation frame; fragmented messages are not supported");
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Drain the outbound queue to the socket. Once the connection closes,
/// flush whatever is already queued and shut the write half down.
async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, conn: Arc<ClientConnection>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => {
                let Some(bytes) = next else { break };
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(error = %e, "socket write failed");
                    let _ = conn.close();
                    return;
                }
            }
            () = conn.closed() => {
                while let Ok(bytes) = rx.try_recv() {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chatwire_core::Principal;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Encoder;

    use super::*;

    /// Echoes text back, and joins topic "t" on `join`.
    struct Echo;

    #[async_trait]
    impl MessageProcessor for Echo {
        async fn process(&self, _: &ClientConnection, raw: &str, session: &mut Session) -> Option<String> {
            if raw == "join" {
                session.join(chatwire_core::Topic::from("t"));
            }
            if raw == "silent" {
                return None;
            }
            if raw == "big" {
                return Some("x".repeat(8192));
            }
            Some(format!("echo:{raw}"))
        }
    }

    struct OnlyToken;

    impl TokenValidator for OnlyToken {
        fn validate(&self, token: &str) -> Option<Principal> {
            (token == "good").then(|| Principal::new(9, "nine"))
        }
    }

    fn context() -> Arc<SessionContext> {
        Arc::new(SessionContext {
            registry: Arc::new(ConnectionRegistry::new()),
            processor: Arc::new(Echo),
            validator: Arc::new(OnlyToken),
            shutdown: CancellationToken::new(),
            read_chunk_size: 64,
            max_frame_size: 1024,
            queue_capacity: 16,
        })
    }

    fn handshake(credential: Option<&str>) -> Handshake {
        Handshake {
            accept_key: "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=".into(),
            origin: None,
            credential: credential.map(str::to_owned),
        }
    }

    fn client_frame(frame: Frame) -> BytesMut {
        let mut out = BytesMut::new();
        FrameCodec::client(1024)
            .encode(frame.masked([1, 2, 3, 4]), &mut out)
            .unwrap();
        out
    }

    struct Client {
        io: DuplexStream,
        buf: BytesMut,
        codec: FrameCodec,
    }

    impl Client {
        async fn read_handshake(&mut self) -> String {
            let mut tmp = [0_u8; 512];
            loop {
                if let Some(end) = crate::http::find_header_end(&self.buf) {
                    let head = self.buf.split_to(end);
                    return String::from_utf8(head.to_vec()).unwrap();
                }
                let n = self.io.read(&mut tmp).await.unwrap();
                assert!(n > 0, "eof before handshake");
                self.buf.extend_from_slice(&tmp[..n]);
            }
        }

        async fn next_frame(&mut self) -> Option<Frame> {
            let mut tmp = [0_u8; 512];
            loop {
                if let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(frame);
                }
                let n = self.io.read(&mut tmp).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.buf.extend_from_slice(&tmp[..n]);
            }
        }

        async fn send(&mut self, frame: Frame) {
            self.io.write_all(&client_frame(frame)).await.unwrap();
        }
    }

    fn start(
        ctx: &Arc<SessionContext>,
        credential: Option<&str>,
        leftover: BytesMut,
    ) -> (Client, tokio::task::JoinHandle<Result<(), ServerError>>) {
        start_with_pipe(ctx, credential, leftover, 4096)
    }

    fn start_with_pipe(
        ctx: &Arc<SessionContext>,
        credential: Option<&str>,
        leftover: BytesMut,
        pipe_size: usize,
    ) -> (Client, tokio::task::JoinHandle<Result<(), ServerError>>) {
        let (client, server) = tokio::io::duplex(pipe_size);
        let task = tokio::spawn(run_ws_session(
            server,
            SocketAddr::from(([127, 0, 0, 1], 5555)),
            ConnectionId::from("s1"),
            leftover,
            handshake(credential),
            Arc::clone(ctx),
        ));
        let client = Client {
            io: client,
            buf: BytesMut::new(),
            codec: FrameCodec::client(1024),
        };
        (client, task)
    }

    #[tokio::test]
    async fn handshake_then_text_round_trip() {
        let ctx = context();
        let (mut client, task) = start(&ctx, None, BytesMut::new());
        let head = client.read_handshake().await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));

        client.send(Frame::text("hello")).await;
        let reply = client.next_frame().await.unwrap();
        assert_eq!(reply.opcode, Opcode::Text);
        assert!(!reply.is_masked());
        assert_eq!(reply.into_text().unwrap(), "echo:hello");
        assert_eq!(ctx.registry.len(), 1);

        client.send(Frame::close(1000, "bye")).await;
        let close = client.next_frame().await.unwrap();
        assert_eq!(close.close_code(), Some(1000));
        task.await.unwrap().unwrap();
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn leftover_bytes_are_processed_first() {
        let ctx = context();
        let (mut client, task) = start(&ctx, None, client_frame(Frame::text("early")));
        let _ = client.read_handshake().await;
        assert_eq!(client.next_frame().await.unwrap().into_text().unwrap(), "echo:early");
        drop(client);
        task.await.unwrap().unwrap();
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn frames_are_handled_in_order_across_split_writes() {
        let ctx = context();
        let (mut client, _task) = start(&ctx, None, BytesMut::new());
        let _ = client.read_handshake().await;

        let mut bytes = client_frame(Frame::text("one"));
        bytes.extend_from_slice(&client_frame(Frame::text("two")));
        let (first, second) = bytes.split_at(5);
        client.io.write_all(first).await.unwrap();
        tokio::task::yield_now().await;
        client.io.write_all(second).await.unwrap();

        assert_eq!(client.next_frame().await.unwrap().into_text().unwrap(), "echo:one");
        assert_eq!(client.next_frame().await.unwrap().into_text().unwrap(), "echo:two");
    }

    #[tokio::test]
    async fn ping_gets_pong_with_same_payload() {
        let ctx = context();
        let (mut client, _task) = start(&ctx, None, BytesMut::new());
        let _ = client.read_handshake().await;
        client.send(Frame::new(Opcode::Ping, Bytes::from_static(b"abc"))).await;
        let pong = client.next_frame().await.unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"abc");
    }

    #[tokio::test]
    async fn binary_and_silent_messages_get_no_reply() {
        let ctx = context();
        let (mut client, _task) = start(&ctx, None, BytesMut::new());
        let _ = client.read_handshake().await;
        client.send(Frame::new(Opcode::Binary, Bytes::from_static(b"\x00\x01"))).await;
        client.send(Frame::text("silent")).await;
        client.send(Frame::text("after")).await;
        assert_eq!(client.next_frame().await.unwrap().into_text().unwrap(), "echo:after");
    }

    #[tokio::test]
    async fn unmasked_frame_ends_session_without_reply() {
        let ctx = context();
        let (mut client, task) = start(&ctx, None, BytesMut::new());
        let _ = client.read_handshake().await;
        let mut raw = BytesMut::new();
        FrameCodec::client(1024).encode(Frame::text("plain"), &mut raw).unwrap();
        client.io.write_all(&raw).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ServerError::FrameDecode(_)));
        assert!(client.next_frame().await.is_none());
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn upgrade_credential_pre_authenticates() {
        let ctx = context();
        let (mut client, _task) = start(&ctx, Some("good"), BytesMut::new());
        let _ = client.read_handshake().await;
        let conn = ctx.registry.get(&ConnectionId::from("s1")).unwrap();
        assert_eq!(conn.session().principal(), Some(Principal::new(9, "nine")));
    }

    #[tokio::test]
    async fn invalid_upgrade_credential_leaves_session_anonymous() {
        let ctx = context();
        let (mut client, _task) = start(&ctx, Some("bad"), BytesMut::new());
        let _ = client.read_handshake().await;
        let conn = ctx.registry.get(&ConnectionId::from("s1")).unwrap();
        assert!(!conn.session().authenticated);
    }

    #[tokio::test]
    async fn session_changes_are_published_to_the_registry() {
        let ctx = context();
        let (mut client, _task) = start(&ctx, Some("good"), BytesMut::new());
        let _ = client.read_handshake().await;
        client.send(Frame::text("join")).await;
        let _ = client.next_frame().await.unwrap();
        let conn = ctx.registry.get(&ConnectionId::from("s1")).unwrap();
        assert!(conn.with_session(|s| s.receives(&chatwire_core::Topic::from("t"))));
    }

    #[tokio::test]
    async fn shutdown_sends_going_away() {
        let ctx = context();
        let (mut client, task) = start(&ctx, None, BytesMut::new());
        let _ = client.read_handshake().await;
        ctx.shutdown.cancel();
        let close = client.next_frame().await.unwrap();
        assert_eq!(close.close_code(), Some(CLOSE_GOING_AWAY));
        task.await.unwrap().unwrap();
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn external_cleanup_ends_session() {
        let ctx = context();
        let (mut client, task) = start(&ctx, None, BytesMut::new());
        let _ = client.read_handshake().await;
        assert!(ctx.registry.cleanup(&ConnectionId::from("s1")));
        task.await.unwrap().unwrap();
        assert!(client.next_frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_reader_does_not_keep_socket_alive() {
        let ctx = context();
        let (mut client, task) = start_with_pipe(&ctx, None, BytesMut::new(), 1024);
        let _ = client.read_handshake().await;

        // The reply outgrows the pipe and the client never reads it.
        client.send(Frame::text("big")).await;
        client.send(Frame::close(1000, "")).await;

        task.await.unwrap().unwrap();
        assert!(ctx.registry.is_empty());
        assert!(
            client.io.write_all(b"more").await.is_err(),
            "server half of the socket should be dropped"
        );
    }
}
