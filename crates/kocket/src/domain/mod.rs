//! Domain layer for kocket.
//!
//! Plain types with no I/O: runtime configuration, connection identity and
//! request metadata, the lifecycle events a host can observe, and the error
//! types those events carry.

pub mod config;
pub mod connection;
pub mod errors;
pub mod events;

pub use config::{ConfigError, ServerConfig};
pub use connection::{ConnectionId, RequestMeta};
pub use errors::{AsyncFault, ConnectionError, SendError, ServerError};
pub use events::ServerEvent;
