//! Client side of the RFC 6455 opening handshake.
//!
//! # How the upgrade works (for beginners)
//!
//! The client sends a plain HTTP `GET` carrying a random base64 nonce in
//! `Sec-WebSocket-Key`.  A genuine websocket server proves it understood the
//! request by answering with
//!
//! ```text
//! Sec-WebSocket-Accept = base64( sha1( key + "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" ) )
//! ```
//!
//! The client recomputes the same value locally and refuses the connection
//! when the two differ.  The jsonRWS relay additionally returns a
//! non-standard `Sec-WebSocket-Socketid` header carrying the identifier it
//! assigned to this connection.

use base64::Engine;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use sha1::{Digest, Sha1};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use super::WEBSOCKET_VERSION;

/// The magic GUID appended to the key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Extension offer sent with every upgrade request.
pub const EXTENSIONS_OFFER: &str = "permessage-deflate; client_max_window_bits";

/// Relay-specific response header carrying the assigned socket id.
pub const SOCKET_ID_HEADER: &str = "sec-websocket-socketid";

/// Upper bound for the HTTP response head; anything larger is not a relay.
pub const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Handshake failures.  All of them are fatal to the connection attempt.
#[derive(Debug, Error, PartialEq)]
pub enum HandshakeError {
    #[error("invalid websocket URL: {0}")]
    InvalidUrl(String),

    #[error("malformed upgrade response: {0}")]
    MalformedResponse(String),

    #[error("expected HTTP 101 Switching Protocols, got {0}")]
    UnexpectedStatus(u16),

    #[error("required \"Connection: Upgrade\" server response header")]
    MissingConnectionUpgrade,

    #[error("required \"Upgrade: websocket\" server response header")]
    MissingUpgradeWebsocket,

    #[error("required \"Sec-WebSocket-Accept: {expected}\" server response header")]
    AcceptMismatch { expected: String },

    #[error("required \"Sec-WebSocket-Version: 13\" server response header")]
    UnsupportedVersion,

    #[error("client does not support subprotocol \"{0}\" sent by the server")]
    UnofferedSubprotocol(String),
}

/// Computes the `Sec-WebSocket-Accept` value for `key`.
///
/// # Examples
///
/// ```rust
/// use rws_core::protocol::handshake::compute_accept_key;
///
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generates a fresh 16-byte nonce, base64 encoded.
pub fn generate_request_key() -> String {
    base64::engine::general_purpose::STANDARD.encode(Uuid::new_v4().as_bytes())
}

// ── URL ───────────────────────────────────────────────────────────────────────

/// A parsed `ws://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// Host as it appears in the URL; IPv6 literals keep their brackets.
    pub host: String,
    pub port: u16,
    /// Path including the query string, always starting with `/`.
    pub path: String,
}

impl WsUrl {
    /// Parses `ws://[user@]host[:port][/path][?query]`.
    ///
    /// Userinfo and fragments are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidUrl`] for unparsable URLs and for
    /// schemes other than `ws` (including `wss`, since this client does not
    /// terminate TLS).
    pub fn parse(url: &str) -> Result<Self, HandshakeError> {
        let parsed = Url::parse(url).map_err(|e| HandshakeError::InvalidUrl(format!("'{url}': {e}")))?;

        if parsed.scheme() != "ws" {
            return Err(HandshakeError::InvalidUrl(format!(
                "unsupported scheme '{}', only ws:// is supported",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| HandshakeError::InvalidUrl(format!("'{url}': empty host")))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| HandshakeError::InvalidUrl(format!("'{url}': no port")))?;
        let path = match parsed.query() {
            Some(query) => format!("{}?{query}", parsed.path()),
            None => parsed.path().to_string(),
        };

        Ok(Self { host, port, path })
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value of the `Host` request header.
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// The HTTP upgrade request sent by the client.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    url: WsUrl,
    key: String,
    protocols: Vec<String>,
    user_agent: String,
}

impl UpgradeRequest {
    /// Builds a request with a freshly generated key.
    pub fn new(url: WsUrl, protocols: Vec<String>) -> Self {
        Self::with_key(url, generate_request_key(), protocols)
    }

    /// Builds a request with a caller-supplied key (deterministic tests).
    pub fn with_key(url: WsUrl, key: String, protocols: Vec<String>) -> Self {
        Self {
            url,
            key,
            protocols,
            user_agent: format!("rws-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    /// Serializes the request head.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: {}\r\n",
            self.url.path,
            self.url.host_header(),
            self.key,
            WEBSOCKET_VERSION,
        );
        if !self.protocols.is_empty() {
            request.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", self.protocols.join(", ")));
        }
        request.push_str(&format!("Sec-WebSocket-Extensions: {EXTENSIONS_OFFER}\r\n"));
        request.push_str(&format!("User-Agent: {}\r\n", self.user_agent));
        request.push_str("\r\n");
        request.into_bytes()
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// Most headers a relay response may carry.
const MAX_RESPONSE_HEADERS: usize = 64;

/// The parsed head of the relay's HTTP response.
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl UpgradeResponse {
    /// Parses a complete response head (status line + headers + blank line).
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::MalformedResponse`] when the head is not a
    /// well-formed HTTP/1.x response or is incomplete.
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut raw_headers);
        match response.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HandshakeError::MalformedResponse("incomplete response head".to_string()))
            }
            Err(e) => return Err(HandshakeError::MalformedResponse(e.to_string())),
        }

        let status = response
            .code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| HandshakeError::MalformedResponse("missing status code".to_string()))?;

        let mut headers = HeaderMap::with_capacity(response.headers.len());
        for raw in response.headers.iter() {
            let name = HeaderName::from_bytes(raw.name.as_bytes())
                .map_err(|e| HandshakeError::MalformedResponse(format!("header '{}': {e}", raw.name)))?;
            let value = HeaderValue::from_bytes(raw.value)
                .map_err(|e| HandshakeError::MalformedResponse(format!("header '{}': {e}", raw.name)))?;
            headers.append(name, value);
        }

        Ok(Self { status, headers })
    }

    /// First value of `name`, if present and printable.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `true` when any `name` header contains `needle`, ignoring case.
    /// `needle` must be lower-case.
    fn contains(&self, name: HeaderName, needle: &str) -> bool {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains(needle))
    }

    /// The socket id the relay assigned, from `sec-websocket-socketid`.
    pub fn socket_id(&self) -> Option<u64> {
        self.header(SOCKET_ID_HEADER).and_then(|v| v.trim().parse().ok())
    }
}

/// Returns the length of the response head (including the blank line) once
/// `buf` contains the terminating `\r\n\r\n`.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Verifies the relay's upgrade response.
///
/// Checks run in a fixed order and the first failure wins.  On success the
/// negotiated subprotocol is returned (`None` when the relay picked none).
///
/// # Errors
///
/// Returns the [`HandshakeError`] describing the first failed check.
pub fn validate_upgrade(
    response: &UpgradeResponse,
    request_key: &str,
    offered_protocols: &[String],
) -> Result<Option<String>, HandshakeError> {
    if response.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(HandshakeError::UnexpectedStatus(response.status.as_u16()));
    }

    if !response.contains(header::CONNECTION, "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    if !response.contains(header::UPGRADE, "websocket") {
        return Err(HandshakeError::MissingUpgradeWebsocket);
    }

    let expected = compute_accept_key(request_key);
    if response.header(header::SEC_WEBSOCKET_ACCEPT.as_str()) != Some(expected.as_str()) {
        return Err(HandshakeError::AcceptMismatch { expected });
    }

    let version_ok = response
        .header(header::SEC_WEBSOCKET_VERSION.as_str())
        .and_then(|v| v.trim().parse::<u8>().ok())
        == Some(WEBSOCKET_VERSION);
    if !version_ok {
        return Err(HandshakeError::UnsupportedVersion);
    }

    match response.header(header::SEC_WEBSOCKET_PROTOCOL.as_str()) {
        Some(chosen) if !chosen.is_empty() => {
            if offered_protocols.iter().any(|p| p == chosen) {
                Ok(Some(chosen.to_string()))
            } else {
                Err(HandshakeError::UnofferedSubprotocol(chosen.to_string()))
            }
        }
        _ => Ok(None),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
