//! Application layer for kocket.
//!
//! Everything a handler touches lives here: the per-connection [`Context`],
//! the [`Pipeline`] that runs handlers over each completed message, and the
//! [`EventSink`] through which failures reach the host.
//!
//! Socket ownership, the accept loop and the registry are infrastructure.

pub mod context;
pub mod events;
pub mod pipeline;

pub use context::{Context, Outbound, Payload};
pub use events::EventSink;
pub use pipeline::{DispatchOutcome, Handler, Next, Pipeline};
