//! Per-connection routing: frame one HTTP request, then either answer it
//! through the [`RequestHandler`] or upgrade to a WebSocket session.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use chatwire_core::ConnectionId;
use metrics::counter;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::errors::ServerError;
use crate::handler::RequestHandler;
use crate::http::{HttpResponse, read_request};
use crate::metrics::{HTTP_REJECTED_TOTAL, HTTP_REQUESTS_TOTAL, WS_HANDSHAKE_REJECTED_TOTAL};
use crate::websocket::handshake::{Handshake, OriginPolicy, is_upgrade_request};
use crate::websocket::session::{SessionContext, run_ws_session};

pub(crate) struct DispatchContext {
    pub read_chunk_size: usize,
    pub max_request_size: usize,
    pub origins: OriginPolicy,
    pub handler: Arc<dyn RequestHandler>,
    pub session: Arc<SessionContext>,
}

/// Serve one accepted connection to completion.
pub(crate) async fn handle_connection<S>(mut stream: S, peer: SocketAddr, ctx: Arc<DispatchContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(ctx.read_chunk_size);
    let request = match read_request(&mut stream, &mut buf, ctx.read_chunk_size, ctx.max_request_size).await {
        Ok(req) => req,
        Err(e) => {
            reject(&mut stream, peer, &e, HTTP_REJECTED_TOTAL).await;
            return;
        }
    };

    if is_upgrade_request(&request) {
        let handshake = match Handshake::negotiate(&request, &ctx.origins) {
            Ok(hs) => hs,
            Err(e) => {
                reject(&mut stream, peer, &e, WS_HANDSHAKE_REJECTED_TOTAL).await;
                return;
            }
        };
        let id = ConnectionId::new();
        debug!(conn_id = %id, %peer, path = %request.path, "upgrading to websocket");
        // Errors are logged inside the session span.
        let _ = run_ws_session(stream, peer, id, buf, handshake, Arc::clone(&ctx.session)).await;
        return;
    }

    let method = request.method;
    let response = match ctx.handler.handle(request).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(%peer, error = %e, "request handler failed");
            HttpResponse::error(500, "Internal server error")
        }
    };
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.as_str(),
        "status" => response.status.to_string()
    )
    .increment(1);
    if let Err(e) = write_and_close(&mut stream, &response).await {
        debug!(%peer, error = %e, "failed to write response");
    }
}

/// Answer a framing or handshake failure, or just close on I/O errors.
async fn reject<S>(stream: &mut S, peer: SocketAddr, err: &ServerError, metric: &'static str)
where
    S: AsyncWrite + Unpin,
{
    let Some(status) = err.status() else {
        debug!(%peer, error = %err, "connection dropped before a request");
        return;
    };
    warn!(%peer, error = %err, status, "rejecting request");
    counter!(metric, "reason" => err.kind()).increment(1);
    let _ = write_and_close(stream, &HttpResponse::error(status, &err.to_string())).await;
}

async fn write_and_close<S>(stream: &mut S, response: &HttpResponse) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&response.to_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
