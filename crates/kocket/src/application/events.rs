//! Fan-out of [`ServerEvent`]s to subscribers.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::{AsyncFault, ConnectionError, ConnectionId, ServerEvent};

/// Cloneable handle for publishing server events.
///
/// Publishing never blocks and never fails: with no subscriber the event is
/// simply dropped, and a lagging subscriber loses the oldest events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ServerEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    /// Logs and publishes a failure on the generic error channel.
    pub fn error(&self, id: Option<ConnectionId>, error: impl Into<ConnectionError>) {
        let error = error.into();
        match id {
            Some(id) => warn!("connection {id}: {error}"),
            None => warn!("{error}"),
        }
        self.emit(ServerEvent::Error {
            id,
            error: Arc::new(error),
        });
    }

    /// Publishes a pipeline fault on both the generic error channel and the
    /// dedicated async-fault channel.
    pub fn async_fault(&self, fault: AsyncFault) {
        warn!("{fault}");
        self.emit(ServerEvent::Error {
            id: Some(fault.connection),
            error: Arc::new(ConnectionError::Pipeline(fault.clone())),
        });
        self.emit(ServerEvent::AsyncError(Arc::new(fault)));
    }
}
