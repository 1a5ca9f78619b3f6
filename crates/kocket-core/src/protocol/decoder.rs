//! Resumable inbound frame decoder.
//!
//! TCP is a stream protocol: one `read()` may deliver half a header, or the
//! tail of one frame followed by three more.  [`FrameDecoder`] therefore keeps
//! its position between calls.  The caller appends every read to a single
//! `BytesMut` and calls [`FrameDecoder::decode`] until it returns `Ok(None)`:
//!
//! ```text
//! AwaitHeader ──► AwaitExtendedLength ──► AwaitMaskKey ──► AwaitPayload
//!      ▲            (126 / 127 only)       (MASK only)          │
//!      └────────────────────────────────────────────────────────┘
//! ```
//!
//! Each state consumes its bytes only once they are all available, so a
//! frame split at any byte boundary decodes exactly like one delivered whole.

use bytes::{Buf, BytesMut};

use crate::protocol::frame::{apply_mask, Frame, Opcode, ProtocolError, EXTENDED_16, EXTENDED_64, FIN_BIT, MASK_BIT};

/// Which side of the connection the decoder is reading for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reading client frames: every frame must be masked.
    Server,
    /// Reading server frames: masking is optional.
    Client,
}

/// Header fields decoded so far, carried between states.
#[derive(Debug, Clone, Copy)]
struct PartialHeader {
    fin: bool,
    rsv: u8,
    opcode: Opcode,
    masked: bool,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    AwaitHeader,
    AwaitExtendedLength {
        header: PartialHeader,
        width: usize,
    },
    AwaitMaskKey {
        header: PartialHeader,
        payload_len: u64,
    },
    AwaitPayload {
        header: PartialHeader,
        payload_len: u64,
        mask_key: Option<[u8; 4]>,
    },
}

/// Incremental RFC 6455 frame decoder.
///
/// One decoder belongs to one connection; it is never shared.
///
/// # Examples
///
/// ```rust
/// use bytes::BytesMut;
/// use kocket_core::protocol::{encode_masked, FrameDecoder, Opcode};
///
/// let wire = encode_masked(Opcode::Text, true, b"hello", [1, 2, 3, 4]);
/// let mut decoder = FrameDecoder::server();
///
/// // Feed the frame in two halves.
/// let mut buf = BytesMut::from(&wire[..3]);
/// assert!(decoder.decode(&mut buf).unwrap().is_none());
/// buf.extend_from_slice(&wire[3..]);
/// let frame = decoder.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(&frame.payload[..], b"hello");
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    role: Role,
    max_payload_size: usize,
    state: DecodeState,
}

impl FrameDecoder {
    /// Default maximum payload size of a single frame (16 MiB).
    pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

    /// Creates a decoder for the given role.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_payload_size: Self::DEFAULT_MAX_PAYLOAD_SIZE,
            state: DecodeState::AwaitHeader,
        }
    }

    /// Decoder for frames sent by clients (mask required).
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Decoder for frames sent by a server (mask optional).
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Sets the largest accepted payload length.
    #[must_use]
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Returns `true` when no partially decoded frame is pending.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::AwaitHeader)
    }

    /// Decodes the next frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold the rest of the frame;
    /// the bytes already consumed are remembered, so the caller just appends
    /// the next read and calls again.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnmaskedFrame`] for an unmasked frame in the
    ///   [`Role::Server`] role.
    /// - [`ProtocolError::PayloadTooLarge`] when the declared length exceeds
    ///   the configured maximum.
    ///
    /// After an error the decoder is reset, but the connection is expected
    /// to be closed by the caller.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::AwaitHeader => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let first = src.get_u8();
                    let second = src.get_u8();

                    let header = PartialHeader {
                        fin: first & FIN_BIT != 0,
                        rsv: (first >> 4) & 0x07,
                        opcode: Opcode::from_u8(first),
                        masked: second & MASK_BIT != 0,
                    };

                    if self.role == Role::Server && !header.masked {
                        self.state = DecodeState::AwaitHeader;
                        return Err(ProtocolError::UnmaskedFrame);
                    }

                    self.state = match second & 0x7F {
                        EXTENDED_16 => DecodeState::AwaitExtendedLength { header, width: 2 },
                        EXTENDED_64 => DecodeState::AwaitExtendedLength { header, width: 8 },
                        base => {
                            self.check_length(u64::from(base))?;
                            Self::after_length(header, u64::from(base))
                        }
                    };
                }

                DecodeState::AwaitExtendedLength { header, width } => {
                    if src.len() < width {
                        return Ok(None);
                    }
                    let payload_len = if width == 2 {
                        u64::from(src.get_u16())
                    } else {
                        src.get_u64()
                    };
                    self.check_length(payload_len)?;
                    self.state = Self::after_length(header, payload_len);
                }

                DecodeState::AwaitMaskKey {
                    header,
                    payload_len,
                } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let mut mask_key = [0u8; 4];
                    src.copy_to_slice(&mut mask_key);
                    self.state = DecodeState::AwaitPayload {
                        header,
                        payload_len,
                        mask_key: Some(mask_key),
                    };
                }

                DecodeState::AwaitPayload {
                    header,
                    payload_len,
                    mask_key,
                } => {
                    // `check_length` already bounded the length by a `usize`.
                    let len = payload_len as usize;
                    if src.len() < len {
                        return Ok(None);
                    }
                    let mut payload = src.split_to(len);
                    if let Some(key) = mask_key {
                        apply_mask(&mut payload, key);
                    }
                    self.state = DecodeState::AwaitHeader;

                    return Ok(Some(Frame {
                        fin: header.fin,
                        rsv: header.rsv,
                        opcode: header.opcode,
                        masked: header.masked,
                        payload_len,
                        mask_key,
                        payload: payload.freeze(),
                    }));
                }
            }
        }
    }

    fn check_length(&mut self, payload_len: u64) -> Result<(), ProtocolError> {
        if payload_len > self.max_payload_size as u64 {
            self.state = DecodeState::AwaitHeader;
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            });
        }
        Ok(())
    }

    fn after_length(header: PartialHeader, payload_len: u64) -> DecodeState {
        if header.masked {
            DecodeState::AwaitMaskKey {
                header,
                payload_len,
            }
        } else {
            DecodeState::AwaitPayload {
                header,
                payload_len,
                mask_key: None,
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::server()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
