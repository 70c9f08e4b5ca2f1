//! Framing one HTTP request off a byte stream.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::request::{HttpRequest, RequestHead};
use crate::errors::ServerError;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Position just past the first `\r\n\r\n`, if any.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|i| i + HEAD_TERMINATOR.len())
}

/// Read one request from `stream`.
///
/// Reads `chunk_size` bytes at a time into `buf` until the head terminator
/// appears, then keeps reading until `Content-Length` body bytes are
/// buffered. Head plus body may not exceed `max_size`. On success the
/// request's bytes are consumed from `buf`; anything the peer sent after it
/// (e.g. a first WebSocket frame) stays in `buf`.
pub async fn read_request<R>(
    stream: &mut R,
    buf: &mut BytesMut,
    chunk_size: usize,
    max_size: usize,
) -> Result<HttpRequest, ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0_u8; chunk_size.max(1)];
    let mut scanned = 0_usize;

    let head_end = loop {
        // Resume the scan a few bytes back in case the terminator straddles reads.
        let from = scanned.saturating_sub(HEAD_TERMINATOR.len() - 1);
        if let Some(end) = find_header_end(&buf[from..]) {
            break from + end;
        }
        scanned = buf.len();
        if buf.len() > max_size {
            return Err(ServerError::SizeLimitExceeded { limit: max_size });
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                ServerError::Io(std::io::ErrorKind::UnexpectedEof.into())
            } else {
                ServerError::Protocol("connection closed before end of request head".into())
            });
        }
        buf.extend_from_slice(&chunk[..n]);
        trace!(read = n, buffered = buf.len(), "read request bytes");
    };

    if head_end > max_size {
        return Err(ServerError::SizeLimitExceeded { limit: max_size });
    }

    let head = RequestHead::parse(&buf[..head_end - HEAD_TERMINATOR.len()])?;
    let body_len = head.content_length()?;
    let total = head_end
        .checked_add(body_len)
        .filter(|&t| t <= max_size)
        .ok_or(ServerError::SizeLimitExceeded { limit: max_size })?;

    while buf.len() < total {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::Protocol(format!(
                "connection closed after {} of {body_len} body bytes",
                buf.len() - head_end
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut request = buf.split_to(total);
    let body = request.split_off(head_end).freeze();
    Ok(HttpRequest::from_parts(head, body))
}
