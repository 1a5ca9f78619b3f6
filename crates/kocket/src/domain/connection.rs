//! Connection identity and immutable request metadata.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use kocket_core::{RequestTarget, UpgradeRequest};
use uuid::Uuid;

/// Identity of one upgraded connection.
///
/// Registry membership is keyed by this id, never by the user-assigned name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the opening request said, derived once at upgrade time.
///
/// Never mutated afterwards; the protocol engine and handlers share it
/// read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub method: String,
    pub protocol: String,
    pub target: RequestTarget,
    /// Header values keyed by lower-cased header name.
    pub headers: HashMap<String, String>,
    pub peer_addr: Option<SocketAddr>,
}

impl RequestMeta {
    pub fn from_request(request: &UpgradeRequest, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            method: request.method.clone(),
            protocol: request.protocol.clone(),
            target: request.request_target(),
            headers: request.headers().clone(),
            peer_addr,
        }
    }

    /// Full request target, e.g. `/chat?room=1`.
    pub fn url(&self) -> &str {
        &self.target.url
    }

    /// Path component, e.g. `/chat`.
    pub fn path(&self) -> &str {
        &self.target.path
    }

    pub fn querystring(&self) -> Option<&str> {
        self.target.querystring.as_deref()
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.target.query.get(key).map(String::as_str)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
