//! WebSocket opening handshake: origin policy, accept key, 101 response,
//! and credential extraction.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::errors::ServerError;
use crate::http::{HttpRequest, Method};

/// GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(sha1(key + GUID))`.
pub fn compute_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

/// Whether the request asks to switch to WebSocket
/// (`Upgrade: websocket` and `Connection: Upgrade`).
pub fn is_upgrade_request(req: &HttpRequest) -> bool {
    req.header("upgrade")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
        && req.headers.has_token("connection", "upgrade")
}

/// Origin allow-list. A request without `Origin` always passes.
#[derive(Clone, Debug, Default)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    /// Policy accepting exactly `allowed` (plus absent origins).
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `origin` may connect.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        origin.is_none_or(|o| self.allowed.iter().any(|a| a == o))
    }

    /// [`allows`](Self::allows) as a `Result`.
    pub fn check(&self, origin: Option<&str>) -> Result<(), ServerError> {
        match origin {
            Some(o) if !self.allows(Some(o)) => Err(ServerError::OriginRejected(o.to_owned())),
            _ => Ok(()),
        }
    }
}

/// Bearer credential carried by the upgrade request, checked in priority
/// order: `?token=`, `auth_token` cookie, `Authorization: Bearer`.
pub fn extract_credential(req: &HttpRequest) -> Option<String> {
    if let Some(token) = req.query_param("token").filter(|t| !t.is_empty()) {
        return Some(token);
    }
    if let Some(token) = req.cookie("auth_token").filter(|t| !t.is_empty()) {
        return Some(token.to_owned());
    }
    req.header("authorization")
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}

/// A validated upgrade request, ready to be answered with 101.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// `Sec-WebSocket-Accept` value.
    pub accept_key: String,
    /// The request's `Origin`, echoed in CORS headers.
    pub origin: Option<String>,
    /// Bearer credential, if one was supplied.
    pub credential: Option<String>,
}

impl Handshake {
    /// Validate an upgrade request.
    ///
    /// Origin is checked first so a rejected origin never gets a handshake
    /// response.
    pub fn negotiate(req: &HttpRequest, policy: &OriginPolicy) -> Result<Self, ServerError> {
        let origin = req.header("origin").map(str::to_owned);
        policy.check(origin.as_deref())?;

        if req.method != Method::Get {
            return Err(ServerError::Handshake(format!(
                "upgrade requires GET, got {}",
                req.method
            )));
        }
        let key = req
            .header("sec-websocket-key")
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ServerError::Handshake("missing Sec-WebSocket-Key".into()))?;

        Ok(Self {
            accept_key: compute_accept_key(key),
            origin,
            credential: extract_credential(req),
        })
    }

    /// The `101 Switching Protocols` response.
    pub fn response(&self) -> Bytes {
        let mut out = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n",
            self.accept_key
        );
        if let Some(origin) = &self.origin {
            out.push_str(&format!(
                "Access-Control-Allow-Origin: {origin}\r\n\
                 Access-Control-Allow-Credentials: true\r\n"
            ));
        }
        out.push_str("\r\n");
        Bytes::from(out)
    }
}
