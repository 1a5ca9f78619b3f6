//! # kocket-core
//!
//! Protocol library for the Kocket WebSocket server.  It contains the opening
//! HTTP upgrade handshake, the RFC 6455 frame codec and the reassembly of
//! fragmented messages.
//!
//! This crate has zero dependencies on sockets or async runtimes: every
//! function takes bytes in and hands bytes (or typed values) back, so the
//! whole protocol surface can be tested without a network.
//!
//! # Architecture overview
//!
//! - **`protocol::handshake`** – Parses the `GET ... Upgrade: websocket`
//!   request, derives the request path and query, and renders the
//!   `101 Switching Protocols` response.
//!
//! - **`protocol::frame`** / **`protocol::decoder`** – The binary framing
//!   format.  Outbound frames are produced in one call; inbound frames are
//!   decoded by a resumable state machine that tolerates a frame being split
//!   across any number of TCP reads.
//!
//! - **`protocol::message`** – Turns a sequence of decoded frames into
//!   complete [`Message`]s and tells the caller what to do with control
//!   frames (close, answer a ping).

pub mod protocol;

pub use protocol::decoder::{FrameDecoder, Role};
pub use protocol::frame::{encode_frame, Frame, Opcode, ProtocolError};
pub use protocol::handshake::{compute_accept_key, HandshakeError, RequestTarget, UpgradeRequest};
pub use protocol::message::{FrameAction, Message, MessageKind, Reassembler};
