//! Protocol module containing the handshake, the frame codec and message
//! reassembly.

pub mod decoder;
pub mod frame;
pub mod handshake;
pub mod message;

pub use decoder::{FrameDecoder, Role};
pub use frame::{apply_mask, encode_control, encode_frame, encode_masked, Frame, Opcode, ProtocolError};
pub use handshake::{compute_accept_key, find_header_end, HandshakeError, RequestTarget, UpgradeRequest};
pub use message::{FrameAction, Message, MessageKind, Reassembler};
