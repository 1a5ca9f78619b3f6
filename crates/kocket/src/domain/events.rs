//! Lifecycle events published by the server.
//!
//! Hosts subscribe with `Server::subscribe()` and receive every event that
//! happens after the subscription.

use std::net::SocketAddr;
use std::sync::Arc;

use super::connection::ConnectionId;
use super::errors::{AsyncFault, ConnectionError};

/// One observable server event.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection completed the handshake and joined the registry.
    Connect {
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        path: String,
    },
    /// A connection left the registry.
    Close { id: ConnectionId },
    /// Any reported failure: protocol violations, send failures and pipeline
    /// faults.  `id` is `None` for failures not tied to one connection.
    Error {
        id: Option<ConnectionId>,
        error: Arc<ConnectionError>,
    },
    /// A pipeline fault.  Also published as [`ServerEvent::Error`].
    AsyncError(Arc<AsyncFault>),
}

impl ServerEvent {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Close { .. } => "close",
            Self::Error { .. } => "error",
            Self::AsyncError(_) => "async_error",
        }
    }

    /// Connection the event concerns, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Self::Connect { id, .. } | Self::Close { id } => Some(*id),
            Self::Error { id, .. } => *id,
            Self::AsyncError(fault) => Some(fault.connection),
        }
    }
}
