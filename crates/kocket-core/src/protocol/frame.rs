//! Frame types and the outbound half of the WebSocket frame codec.
//!
//! Wire format (RFC 6455 §5.2), all multi-byte integers big-endian:
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Masking-key (0 or 4 bytes), then payload data ...         |
//! +---------------------------------------------------------------+
//! ```
//!
//! Server-to-client frames are never masked and never fragmented by this
//! crate.  The decoding half lives in [`crate::protocol::decoder`].

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::message::MessageKind;

/// FIN bit in the first header byte.
pub const FIN_BIT: u8 = 0x80;

/// MASK bit in the second header byte.
pub const MASK_BIT: u8 = 0x80;

/// Largest payload length that fits in the 7-bit base length field.
pub const MAX_BASE_LEN: u64 = 125;

/// Base length marker announcing a 16-bit extended length.
pub const EXTENDED_16: u8 = 126;

/// Base length marker announcing a 64-bit extended length.
pub const EXTENDED_64: u8 = 127;

/// Errors raised while decoding frames or reassembling messages.
///
/// Every variant is fatal for the connection that produced it and for that
/// connection only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A client frame arrived without the MASK bit.  Clients must mask every
    /// frame they send.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// The declared payload length of a single frame exceeds the limit.
    #[error("frame payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: u64, max: usize },

    /// A fragmented message grew beyond the limit while being reassembled.
    #[error("reassembled message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
}

// ── Opcode ────────────────────────────────────────────────────────────────────

/// 4-bit frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continues the fragmentation run started by a Text or Binary frame.
    Continuation,
    /// First frame of a UTF-8 text message.
    Text,
    /// First frame of a binary message.
    Binary,
    /// Connection close.
    Close,
    /// Keepalive request; must be answered with a Pong.
    Ping,
    /// Keepalive reply.
    Pong,
    /// Any opcode RFC 6455 reserves for future use (3-7, 0xB-0xF).
    Reserved(u8),
}

impl Opcode {
    /// Maps the low nibble of the first header byte to an opcode.
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Returns the 4-bit wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(value) => value & 0x0F,
        }
    }

    /// Returns `true` for Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl From<MessageKind> for Opcode {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Text => Self::Text,
            MessageKind::Binary => Self::Binary,
        }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded wire frame.
///
/// Frames are transient: the decoder produces one, the
/// [`Reassembler`](crate::protocol::message::Reassembler) consumes it.  The
/// payload is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// RSV1-3 as the three low bits (RSV1 = 0b100).  Not validated.
    pub rsv: u8,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload_len: u64,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Bytes,
}

// ── Masking ───────────────────────────────────────────────────────────────────

/// XORs `payload` in place with the 4-byte masking key.
///
/// Masking is an involution: applying the same key twice restores the input.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encodes a complete, unfragmented, unmasked data frame.
///
/// This is what every `send` on the server side goes through.
///
/// # Examples
///
/// ```rust
/// use kocket_core::{encode_frame, MessageKind};
///
/// let bytes = encode_frame(MessageKind::Text, b"hi");
/// assert_eq!(&bytes[..], &[0x81, 0x02, b'h', b'i']);
/// ```
pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> Bytes {
    encode_control(Opcode::from(kind), true, payload)
}

/// Encodes an unmasked frame with an arbitrary opcode and FIN bit.
///
/// Used for control replies (the Pong answering a Ping keeps the Ping's FIN
/// bit) and by [`encode_frame`].
pub fn encode_control(opcode: Opcode, fin: bool, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header_len(payload.len() as u64, false) + payload.len());
    put_header(&mut buf, first_byte(opcode, fin), payload.len() as u64, None);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Encodes a masked frame the way a client would send it.
///
/// The server never emits masked frames; this exists so tools and tests can
/// speak the client side of the wire format.
pub fn encode_masked(opcode: Opcode, fin: bool, payload: &[u8], mask_key: [u8; 4]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header_len(payload.len() as u64, true) + payload.len());
    put_header(&mut buf, first_byte(opcode, fin), payload.len() as u64, Some(mask_key));
    let start = buf.len();
    buf.extend_from_slice(payload);
    apply_mask(&mut buf[start..], mask_key);
    buf.freeze()
}

/// Size of the header (fixed part, extended length and mask key) for a
/// payload of `len` bytes.
pub fn header_len(len: u64, masked: bool) -> usize {
    let length_bytes = if len <= MAX_BASE_LEN {
        0
    } else if len <= u64::from(u16::MAX) {
        2
    } else {
        8
    };
    2 + length_bytes + if masked { 4 } else { 0 }
}

fn first_byte(opcode: Opcode, fin: bool) -> u8 {
    let fin = if fin { FIN_BIT } else { 0 };
    fin | opcode.as_u8()
}

/// Writes the header.  The extended length is always written at the full
/// width of its tier: 2 bytes for 126..=65535, 8 bytes above.
fn put_header(buf: &mut BytesMut, first: u8, len: u64, mask_key: Option<[u8; 4]>) {
    let mask = if mask_key.is_some() { MASK_BIT } else { 0 };
    buf.put_u8(first);
    if len <= MAX_BASE_LEN {
        buf.put_u8(mask | len as u8);
    } else if len <= u64::from(u16::MAX) {
        buf.put_u8(mask | EXTENDED_16);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask | EXTENDED_64);
        buf.put_u64(len);
    }
    if let Some(key) = mask_key {
        buf.put_slice(&key);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_from_u8_known_values() {
        assert_eq!(Opcode::from_u8(0x0), Opcode::Continuation);
        assert_eq!(Opcode::from_u8(0x1), Opcode::Text);
        assert_eq!(Opcode::from_u8(0x2), Opcode::Binary);
        assert_eq!(Opcode::from_u8(0x8), Opcode::Close);
        assert_eq!(Opcode::from_u8(0x9), Opcode::Ping);
        assert_eq!(Opcode::from_u8(0xA), Opcode::Pong);
    }

    #[test]
    fn test_opcode_reserved_values_round_trip() {
        for raw in [0x3, 0x7, 0xB, 0xF] {
            let opcode = Opcode::from_u8(raw);
            assert_eq!(opcode, Opcode::Reserved(raw));
            assert_eq!(opcode.as_u8(), raw);
        }
    }

    #[test]
    fn test_opcode_is_control() {
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Close.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Continuation.is_control());
    }

    #[test]
    fn test_apply_mask_is_its_own_inverse() {
        // Arrange
        let original = b"Hello, WebSocket".to_vec();
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let mut data = original.clone();

        // Act
        apply_mask(&mut data, key);
        assert_ne!(data, original);
        apply_mask(&mut data, key);

        // Assert
        assert_eq!(data, original);
    }

    #[test]
    fn test_apply_mask_rfc_example() {
        // RFC 6455 §5.7: masked "Hello" with key 37 fa 21 3d.
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, [0x37, 0xFA, 0x21, 0x3D]);
        assert_eq!(data, vec![0x7F, 0x9F, 0x4D, 0x51, 0x58]);
    }

    #[test]
    fn test_encode_text_frame_header() {
        let bytes = encode_frame(MessageKind::Text, b"Hello");
        assert_eq!(&bytes[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encode_binary_frame_header() {
        let bytes = encode_frame(MessageKind::Binary, &[1, 2, 3]);
        assert_eq!(bytes[0], 0x82);
        assert_eq!(bytes[1], 3);
    }

    #[test]
    fn test_encode_empty_payload() {
        let bytes = encode_frame(MessageKind::Text, b"");
        assert_eq!(&bytes[..], &[0x81, 0x00]);
    }

    #[test]
    fn test_encode_126_uses_16_bit_length() {
        let payload = vec![0u8; 126];
        let bytes = encode_frame(MessageKind::Binary, &payload);
        assert_eq!(bytes[1], EXTENDED_16);
        assert_eq!(&bytes[2..4], &[0x00, 0x7E]);
        assert_eq!(bytes.len(), 4 + 126);
    }

    #[test]
    fn test_encode_65535_still_uses_16_bit_length() {
        let payload = vec![0u8; 65535];
        let bytes = encode_frame(MessageKind::Binary, &payload);
        assert_eq!(bytes[1], EXTENDED_16);
        assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_65536_writes_full_eight_byte_length() {
        // The 64-bit branch must always carry exactly 8 length bytes.
        let payload = vec![0u8; 65536];
        let bytes = encode_frame(MessageKind::Binary, &payload);
        assert_eq!(bytes[1], EXTENDED_64);
        assert_eq!(&bytes[2..10], &[0, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(bytes.len(), 10 + 65536);
    }

    #[test]
    fn test_encode_control_preserves_fin() {
        let with_fin = encode_control(Opcode::Pong, true, b"x");
        let without_fin = encode_control(Opcode::Pong, false, b"x");
        assert_eq!(with_fin[0], 0x8A);
        assert_eq!(without_fin[0], 0x0A);
    }

    #[test]
    fn test_encode_masked_sets_mask_bit_and_key() {
        let key = [1, 2, 3, 4];
        let bytes = encode_masked(Opcode::Text, true, b"abcd", key);
        assert_eq!(bytes[1], MASK_BIT | 4);
        assert_eq!(&bytes[2..6], &key);
        assert_eq!(&bytes[6..], &[b'a' ^ 1, b'b' ^ 2, b'c' ^ 3, b'd' ^ 4]);
    }

    #[test]
    fn test_header_len_tiers() {
        assert_eq!(header_len(0, false), 2);
        assert_eq!(header_len(125, false), 2);
        assert_eq!(header_len(126, false), 4);
        assert_eq!(header_len(65535, true), 8);
        assert_eq!(header_len(65536, false), 10);
        assert_eq!(header_len(65536, true), 14);
    }
}
