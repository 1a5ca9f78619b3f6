//! # kocket
//!
//! A small WebSocket server.  Every complete message a client sends runs
//! through an ordered pipeline of handlers, each of which decides whether
//! the next one runs.
//!
//! # Architecture
//!
//! ```text
//! Client (RFC 6455 frames over TCP)
//!         ↕
//! [kocket]
//!   ├── domain/           Config, connection identity, events, error types
//!   ├── application/      Context (per-connection API), Pipeline, EventSink
//!   └── infrastructure/
//!         ├── server/     Server handle and accept loop
//!         ├── connection/ Handshake, read loop, writer task
//!         └── registry/   Live connections, broadcast, send_to
//!         ↕
//! [kocket-core]           Handshake parsing, frame codec, reassembly
//! ```
//!
//! # Layer rules
//!
//! - `domain` performs no I/O.
//! - `application` never touches a socket; sends go through a queue.
//! - `infrastructure` owns every socket and every spawned task.
//!
//! # Failures
//!
//! Nothing a client does can bring the server down.  Protocol violations
//! close the offending connection; handler errors and panics are caught per
//! message.  Both are published as [`ServerEvent`]s, which a host observes
//! through [`Server::subscribe`].

/// Domain layer: plain types, no I/O.
pub mod domain;

/// Application layer: the per-connection context and the handler pipeline.
pub mod application;

/// Infrastructure layer: listener, connections and the registry.
pub mod infrastructure;

pub use application::{Context, DispatchOutcome, Handler, Next, Payload};
pub use domain::{
    AsyncFault, ConfigError, ConnectionError, ConnectionId, RequestMeta, SendError, ServerConfig,
    ServerError, ServerEvent,
};
pub use infrastructure::{Listening, Server};
pub use kocket_core::{Message, MessageKind};
