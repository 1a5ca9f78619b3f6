//! The public server handle and its accept loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::application::{Context, EventSink, Handler, Payload, Pipeline};
use crate::domain::{ServerConfig, ServerError, ServerEvent};
use crate::infrastructure::connection::handle_connection;
use crate::infrastructure::registry::Registry;

/// How often the accept loop checks whether it should stop.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// State shared by the server handle, the accept loop and every connection.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Registry,
    pub(crate) pipeline: Pipeline,
    pub(crate) events: EventSink,
    running: AtomicBool,
    listening: AtomicBool,
}

/// A WebSocket server.
///
/// Cloning is cheap and every clone drives the same server, so a handler can
/// hold one to broadcast from inside the pipeline.
///
/// ```no_run
/// use std::sync::Arc;
/// use kocket::{Context, Next, Server, ServerConfig};
///
/// # async fn run() -> anyhow::Result<()> {
/// let server = Server::new(ServerConfig::default());
/// server.use_handler(|ctx: Arc<Context>, next: Next| async move {
///     if let Some(text) = ctx.text() {
///         ctx.send(text);
///     }
///     next.run().await
/// });
/// let listening = server.listen().await?;
/// println!("listening on {}", listening.local_addr());
/// listening.wait().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let events = EventSink::new(config.event_capacity);
        Self {
            shared: Arc::new(Shared {
                registry: Registry::new(events.clone()),
                pipeline: Pipeline::new(),
                events,
                config,
                running: AtomicBool::new(false),
                listening: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Appends a handler to the pipeline.
    pub fn use_handler(&self, handler: impl Handler) -> &Self {
        self.shared.pipeline.use_handler(handler);
        self
    }

    /// Sends `data` to every open connection.  Returns the number of
    /// connections the frame was queued on.
    pub async fn broadcast(&self, data: impl Into<Payload>) -> usize {
        self.shared.registry.broadcast(data).await
    }

    /// Sends `data` to every connection named `name`.
    pub async fn send_to(&self, name: &str, data: impl Into<Payload>) -> usize {
        self.shared.registry.send_to(name, data).await
    }

    /// Receives every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Snapshot of the open connections.
    pub async fn connections(&self) -> Vec<Arc<Context>> {
        self.shared.registry.snapshot().await
    }

    /// Binds the configured address and starts accepting connections.
    ///
    /// Returns once the listener is bound; the returned [`Listening`] carries
    /// the actual address (useful with port `0`).
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyListening`] on a second call.
    /// - [`ServerError::Config`] if the configuration does not validate.
    /// - [`ServerError::Bind`] if the address cannot be bound.
    pub async fn listen(&self) -> Result<Listening, ServerError> {
        if self.shared.listening.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyListening);
        }

        let bind_addr = self.shared.config.bind_addr;
        let bound = match self.shared.config.validate() {
            Ok(()) => TcpListener::bind(bind_addr)
                .await
                .and_then(|listener| Ok((listener.local_addr()?, listener)))
                .map_err(|source| ServerError::Bind {
                    addr: bind_addr,
                    source,
                }),
            Err(e) => Err(e.into()),
        };
        let (local_addr, listener) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.shared.listening.store(false, Ordering::Release);
                return Err(e);
            }
        };

        info!("kocket listening on {local_addr}");
        self.shared.running.store(true, Ordering::Release);
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.shared)));
        Ok(Listening { local_addr, task })
    }

    /// Stops accepting connections and closes the open ones.
    ///
    /// The accept loop notices within one poll interval.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_addr", &self.shared.config.bind_addr)
            .field("connections", &self.connection_count())
            .field("handlers", &self.shared.pipeline.len())
            .finish()
    }
}

/// A bound, running accept loop.
#[derive(Debug)]
pub struct Listening {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Listening {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits until the accept loop has stopped (see [`Server::shutdown`]).
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("accept loop terminated abnormally: {e}");
        }
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        if !shared.running.load(Ordering::Acquire) {
            info!("shutdown requested; stopping accept loop");
            break;
        }

        // A bounded wait keeps the loop responsive to the running flag when
        // no client is connecting.
        match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!("accepted TCP connection from {peer_addr}");
                tokio::spawn(handle_connection(stream, Some(peer_addr), Arc::clone(&shared)));
            }
            // Transient (e.g. out of file descriptors); keep serving.
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }

    drop(listener);
    for ctx in shared.registry.snapshot().await {
        ctx.destroy();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
