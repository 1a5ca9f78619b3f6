//! Infrastructure layer for kocket.
//!
//! Everything that owns a socket lives here: the accept loop, the
//! per-connection read and write tasks, and the registry that broadcasts
//! reach through.
//!
//! # What does NOT belong here?
//!
//! - Frame and handshake encoding (that is `kocket-core`)
//! - The handler contract and the per-connection API (that is the
//!   application layer)

pub mod connection;
pub mod registry;
pub mod server;

pub use registry::Registry;
pub use server::{Listening, Server};
