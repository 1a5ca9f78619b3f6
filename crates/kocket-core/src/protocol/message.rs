//! Message reassembly and control-frame handling.
//!
//! A *message* is one or more frames forming a fragmentation run: a Text or
//! Binary frame starts the run, Continuation frames extend it, and the first
//! frame with FIN set completes it.  Control frames (Close, Ping, Pong) may
//! arrive in the middle of a run and never disturb it.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::protocol::frame::{Frame, Opcode, ProtocolError};

/// Logical type of a message, fixed by the opcode of the run's first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub data: Bytes,
}

impl Message {
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Text,
            data: data.into(),
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            data: data.into(),
        }
    }

    /// Returns the payload as UTF-8, replacing invalid sequences.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// What the connection should do after a frame has been pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAction {
    /// The frame extended (or started) a run that is not finished yet.
    Pending,
    /// A run finished; dispatch this message.
    Message(Message),
    /// The peer sent Close: shut the connection down now.
    Close,
    /// The peer sent Ping: write a Pong with this payload and FIN bit.
    Pong { fin: bool, payload: Bytes },
    /// Nothing to do (Pong, reserved opcodes, orphan continuations).
    Ignored,
}

/// Per-connection fragmentation state.
///
/// Owned by the connection's read loop; handlers never see it.
#[derive(Debug)]
pub struct Reassembler {
    kind: Option<MessageKind>,
    buffer: BytesMut,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            kind: None,
            buffer: BytesMut::new(),
            max_message_size,
        }
    }

    /// Returns `true` while a fragmentation run is open.
    pub fn in_progress(&self) -> bool {
        self.kind.is_some()
    }

    /// Bytes accumulated for the open run.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feeds one decoded frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MessageTooLarge`] when a run grows beyond the
    /// configured limit.  The open run is discarded.
    pub fn push(&mut self, frame: Frame) -> Result<FrameAction, ProtocolError> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.kind.is_some() {
                    trace!(
                        discarded = self.buffer.len(),
                        "new data frame replaces unterminated run"
                    );
                }
                self.kind = Some(if frame.opcode == Opcode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                });
                self.buffer.clear();
                self.append(&frame.payload)?;
            }
            Opcode::Continuation => {
                if self.kind.is_none() {
                    trace!(len = frame.payload.len(), "continuation without an open run");
                    return Ok(FrameAction::Ignored);
                }
                self.append(&frame.payload)?;
            }
            Opcode::Close => return Ok(FrameAction::Close),
            Opcode::Ping => {
                return Ok(FrameAction::Pong {
                    fin: frame.fin,
                    payload: frame.payload,
                })
            }
            Opcode::Pong | Opcode::Reserved(_) => return Ok(FrameAction::Ignored),
        }

        if !frame.fin {
            return Ok(FrameAction::Pending);
        }

        match self.kind.take() {
            Some(kind) => {
                let data = self.buffer.split().freeze();
                Ok(FrameAction::Message(Message { kind, data }))
            }
            None => Ok(FrameAction::Ignored),
        }
    }

    fn append(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let size = self.buffer.len() + payload.len();
        if size > self.max_message_size {
            self.kind = None;
            self.buffer.clear();
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        self.buffer.extend_from_slice(payload);
        Ok(())
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(crate::protocol::decoder::FrameDecoder::DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
