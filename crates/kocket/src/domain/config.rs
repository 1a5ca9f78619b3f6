//! Server configuration.
//!
//! [`ServerConfig`] is the single source of truth for runtime settings.  It
//! can be built from defaults, read from a TOML file, or assembled by the
//! binary from CLI arguments.  Every field is optional in TOML:
//!
//! ```toml
//! bind_addr = "0.0.0.0:7007"
//! max_payload_size = 1048576
//! max_handshake_size = 8192
//! read_buffer_size = 8192
//! event_capacity = 256
//! outbound_queue_size = 128
//! close_timeout_ms = 1000
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but makes no sense (e.g. a zero buffer size).
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// All runtime configuration for the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to.  Port `0` picks a free port.
    pub bind_addr: SocketAddr,

    /// Largest accepted frame payload, and largest reassembled message.
    pub max_payload_size: usize,

    /// Largest accepted HTTP header block during the handshake.
    pub max_handshake_size: usize,

    /// Bytes reserved in the read buffer before each socket read.
    pub read_buffer_size: usize,

    /// Capacity of the event channel.  Slow subscribers lose the oldest
    /// events beyond this.
    pub event_capacity: usize,

    /// Frames a connection may have queued for its writer.  Sends beyond
    /// this are dropped and reported as [`SendError::QueueFull`](super::SendError::QueueFull).
    pub outbound_queue_size: usize,

    /// How long a closing connection may spend flushing queued frames before
    /// the socket is dropped, in milliseconds.
    pub close_timeout_ms: u64,
}

impl Default for ServerConfig {
    /// | Field              | Default         |
    /// |--------------------|-----------------|
    /// | bind_addr          | `0.0.0.0:7007`  |
    /// | max_payload_size   | 16 MiB          |
    /// | max_handshake_size | 8 KiB           |
    /// | read_buffer_size   | 8 KiB           |
    /// | event_capacity     | 256             |
    /// | outbound_queue_size| 128             |
    /// | close_timeout_ms   | 1000            |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7007)),
            max_payload_size: 16 * 1024 * 1024,
            max_handshake_size: 8 * 1024,
            read_buffer_size: 8 * 1024,
            event_capacity: 256,
            outbound_queue_size: 128,
            close_timeout_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document; absent fields keep their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML, [`ConfigError::Invalid`]
    /// for zero sizes.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`ServerConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Rejects values the server cannot run with.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("max_payload_size", self.max_payload_size),
            ("max_handshake_size", self.max_handshake_size),
            ("read_buffer_size", self.read_buffer_size),
            ("event_capacity", self.event_capacity),
            ("outbound_queue_size", self.outbound_queue_size),
        ];
        match sizes.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Invalid(format!("{name} must be greater than 0"))),
            None => Ok(()),
        }
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
