//! Opening handshake (RFC 6455 §4): parse the upgrade request, answer with
//! `101 Switching Protocols`.
//!
//! ```http
//! GET /chat?room=1 HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! Extensions and subprotocols offered by the client are ignored.

use std::collections::HashMap;

use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Reasons a request cannot be upgraded.
///
/// None of these is reported to the peer: the server simply closes the
/// connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The request line is not `METHOD TARGET PROTOCOL`.
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// The request does not ask for `Connection: Upgrade` + `Upgrade: websocket`.
    #[error("request is not a websocket upgrade")]
    NotUpgrade,

    /// The upgrade request carries no `Sec-WebSocket-Key`.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    /// The header block did not end within the allowed size.
    #[error("request header exceeds {max} bytes")]
    TooLarge { max: usize },

    /// The peer closed the connection before finishing the request.
    #[error("connection closed during handshake")]
    Incomplete,
}

// ── Accept token ──────────────────────────────────────────────────────────────

/// Computes the `Sec-WebSocket-Accept` value for a client key.
///
/// # Examples
///
/// ```rust
/// use kocket_core::compute_accept_key;
///
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Returns the length of the header block (including the blank line) if
/// `buf` already contains all of it.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

// ── Request ───────────────────────────────────────────────────────────────────

/// The parsed opening request.  Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    /// Request target as sent, e.g. `/chat?room=1`.
    pub target: String,
    /// Protocol token, e.g. `HTTP/1.1`; echoed in the response status line.
    pub protocol: String,
    pub raw_request_line: String,
    /// Header values keyed by lower-cased header name.
    headers: HashMap<String, String>,
}

impl UpgradeRequest {
    /// Parses the request line and headers up to the first blank line.
    ///
    /// Header lines without a `:` are skipped; a header that appears twice
    /// keeps its last value.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::MalformedRequestLine`] if the first line
    /// does not have three space-separated parts.
    pub fn parse(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let text = String::from_utf8_lossy(bytes);
        let mut lines = text.split("\r\n").skip_while(|line| line.trim().is_empty());

        let request_line = lines.next().unwrap_or_default().trim();
        let mut parts = request_line.split_whitespace();
        let (method, target, protocol) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(p)) => (m, t, p),
            _ => return Err(HandshakeError::MalformedRequestLine(request_line.to_string())),
        };

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            protocol: protocol.to_string(),
            raw_request_line: request_line.to_string(),
            headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// All headers, keyed by lower-cased name.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// `true` when the request carries `Connection: Upgrade` and
    /// `Upgrade: websocket`.
    ///
    /// `Connection` may list several tokens (`keep-alive, Upgrade`).
    pub fn is_websocket_upgrade(&self) -> bool {
        let connection_upgrade = self.header("connection").is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        let upgrade_websocket = self
            .header("upgrade")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));
        connection_upgrade && upgrade_websocket
    }

    /// Validates the request and renders the `101` response.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::NotUpgrade`] or [`HandshakeError::MissingKey`]; the
    /// caller closes the connection without writing anything.
    pub fn accept(&self) -> Result<String, HandshakeError> {
        if !self.is_websocket_upgrade() {
            return Err(HandshakeError::NotUpgrade);
        }
        let key = self
            .header("sec-websocket-key")
            .filter(|key| !key.is_empty())
            .ok_or(HandshakeError::MissingKey)?;
        Ok(render_response(&self.protocol, &compute_accept_key(key)))
    }

    /// Splits the target into path and query.
    pub fn request_target(&self) -> RequestTarget {
        RequestTarget::parse(&self.target)
    }
}

/// Renders the `101 Switching Protocols` response for `protocol`.
pub fn render_response(protocol: &str, accept_token: &str) -> String {
    format!(
        "{protocol} 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_token}\r\n\
         \r\n"
    )
}

// ── Request target ────────────────────────────────────────────────────────────

/// Path and query derived from the request target.
///
/// No percent-decoding is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestTarget {
    pub url: String,
    pub path: String,
    pub querystring: Option<String>,
    /// `key=value` pairs; a key without `=` maps to `""`.
    pub query: HashMap<String, String>,
}

impl RequestTarget {
    pub fn parse(url: &str) -> Self {
        let (path, querystring) = match url.split_once('?') {
            Some((path, qs)) => (path, Some(qs)),
            None => (url, None),
        };

        let query = querystring
            .into_iter()
            .flat_map(|qs| qs.split('&'))
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        Self {
            url: url.to_string(),
            path: path.to_string(),
            querystring: querystring.map(str::to_string),
            query,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
