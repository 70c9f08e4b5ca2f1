//! HTTP/1.1 response serialization.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::request::Headers;

/// A response written once, after which the connection is closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Headers, excluding `Content-Length` and `Connection` (set on write).
    pub headers: Headers,
    /// Body bytes.
    pub body: Bytes,
}

impl HttpResponse {
    /// Empty response with `status`.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.insert("Content-Type", content_type);
        self.body = body.into();
        self
    }

    /// `application/json` response from any serializable value.
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status).with_body("application/json; charset=utf-8", body),
            Err(e) => Self::error(500, &format!("failed to serialize response: {e}")),
        }
    }

    /// `text/plain` response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status).with_body("text/plain; charset=utf-8", body.into())
    }

    /// Standard JSON error envelope:
    /// `{"status":"error","code":N,"message":...,"timestamp":...}`.
    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::json!({
            "status": "error",
            "code": status,
            "message": message,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        Self::new(status).with_body("application/json; charset=utf-8", body.to_string())
    }

    /// Serialize with `Content-Length` and `Connection: close`.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(128 + self.body.len());
        out.put_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            out.put_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.put_slice(b"Connection: close\r\n\r\n");
        out.put_slice(&self.body);
        out.freeze()
    }
}

/// Reason phrase for the status codes this server emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
