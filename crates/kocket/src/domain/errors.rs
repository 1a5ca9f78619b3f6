//! Error types surfaced to the host through [`ServerEvent`](super::ServerEvent).

use std::fmt;
use std::net::SocketAddr;

use kocket_core::ProtocolError;
use thiserror::Error;

use super::config::ConfigError;
use super::connection::ConnectionId;

/// Marker prefixed to every rendered pipeline fault.
pub const ASYNC_FAULT_MARKER: &str = "<kocket> AsyncError";

/// A send that could not be completed.
///
/// `send` never returns these; they are published on the event channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The connection is closed or its writer has stopped.
    #[error("connection is closed")]
    Closed,

    /// The connection's outbound queue is full; the frame was dropped.
    #[error("outbound queue is full")]
    QueueFull,

    /// A structured value could not be serialized to JSON.
    #[error("failed to serialize payload: {0}")]
    Serialize(String),

    /// Writing to the socket failed.
    #[error("socket write failed: {0}")]
    Write(String),

    /// A streaming source failed before reaching its end.
    #[error("failed to read stream payload: {0}")]
    StreamRead(String),
}

/// Anything that can go wrong on one connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer violated the framing protocol; the connection was closed.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// An outbound message could not be delivered.
    #[error("send failed: {0}")]
    Send(#[from] SendError),

    /// A pipeline handler failed.
    #[error("{0}")]
    Pipeline(AsyncFault),

    /// The transport reported an I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the server as a whole.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `listen` was called on a server that is already listening.
    #[error("server is already listening")]
    AlreadyListening,

    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ── Pipeline faults ───────────────────────────────────────────────────────────

/// A handler failure caught at the dispatch boundary.
///
/// Carries the failing handler's message, the rest of its cause chain and
/// where it happened.  Rendered as:
///
/// ```text
/// <kocket> AsyncError: database unavailable
///     caused by: connection refused
///     in handler #1 on connection 6f1c…
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncFault {
    pub connection: ConnectionId,
    /// Index of the handler that raised the error, when it is known.
    pub handler_index: Option<usize>,
    pub message: String,
    /// Cause chain below `message`, outermost first.
    pub causes: Vec<String>,
}

impl AsyncFault {
    /// Wraps a handler error.  The head of the chain becomes the message;
    /// the remaining causes are kept as the trace.
    pub fn from_error(
        connection: ConnectionId,
        handler_index: Option<usize>,
        error: &anyhow::Error,
    ) -> Self {
        Self {
            connection,
            handler_index,
            message: error.to_string(),
            causes: error.chain().skip(1).map(ToString::to_string).collect(),
        }
    }

    /// Wraps the payload of a panicking handler.
    pub fn from_panic(
        connection: ConnectionId,
        handler_index: Option<usize>,
        payload: &(dyn std::any::Any + Send),
    ) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        Self {
            connection,
            handler_index,
            message: format!("panic: {message}"),
            causes: Vec::new(),
        }
    }
}

impl fmt::Display for AsyncFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ASYNC_FAULT_MARKER}: {}", self.message)?;
        for cause in &self.causes {
            write!(f, "\n    caused by: {cause}")?;
        }
        match self.handler_index {
            Some(index) => write!(f, "\n    in handler #{index} on connection {}", self.connection),
            None => write!(f, "\n    on connection {}", self.connection),
        }
    }
}

impl std::error::Error for AsyncFault {}

// ── Tests ─────────────────────────────────────────────────────────────────────
