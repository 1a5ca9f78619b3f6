//! Membership of live connections and fan-out to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::application::{Context, EventSink, Payload};
use crate::domain::ConnectionId;

/// Live connections, keyed by id.
///
/// Sends iterate over a snapshot taken under the read lock, so a connection
/// joining or leaving mid-broadcast never invalidates the iteration.
pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, Arc<Context>>>,
    /// Mirrors the map size so counting needs no lock.
    active_count: AtomicUsize,
    events: EventSink,
}

impl Registry {
    pub fn new(events: EventSink) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            events,
        }
    }

    pub async fn add(&self, ctx: Arc<Context>) {
        let mut conns = self.connections.write().await;
        if conns.insert(ctx.id(), ctx).is_none() {
            self.active_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Removes a connection; returns it if it was a member.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Context>> {
        let removed = self.connections.write().await.remove(&id);
        if removed.is_some() {
            self.active_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Context>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn snapshot(&self) -> Vec<Arc<Context>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Sends `data` to every member.  Returns how many accepted the frame.
    pub async fn broadcast(&self, data: impl Into<Payload>) -> usize {
        self.send_where(|_| true, data.into(), "all").await
    }

    /// Sends `data` to every member named `name`.  No match is not an error.
    pub async fn send_to(&self, name: &str, data: impl Into<Payload>) -> usize {
        self.send_where(|ctx| ctx.has_name(name), data.into(), name).await
    }

    /// Encodes once, then queues on each matching member.  One member's
    /// failure is reported on its own and never stops the loop.
    async fn send_where(
        &self,
        filter: impl Fn(&Context) -> bool,
        payload: Payload,
        label: &str,
    ) -> usize {
        let frame = match payload.encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.events.error(None, e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut recipients = 0;
        for ctx in self.snapshot().await {
            if !filter(&ctx) {
                continue;
            }
            recipients += 1;
            match ctx.enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => self.events.error(Some(ctx.id()), e),
            }
        }
        debug!(label, recipients, delivered, "broadcast");
        delivered
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
