//! Application messages and fragment reassembly (RFC 6455 Section 5.4).
//!
//! Fragmented messages consist of a first fragment (FIN=0, data opcode), zero
//! or more continuation fragments (FIN=0, opcode 0x0), and a final fragment
//! (FIN=1, opcode 0x0). Control frames may be interleaved between fragments;
//! they are handled by the connection before reaching the assembler.

use crate::close::WsCloseCode;
use crate::frame::{WsFrame, WsOpcode};

/// Maximum reassembled message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A complete data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(s) => s.as_bytes(),
            Message::Binary(b) => b,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(s.to_string())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(s)
    }
}

impl From<Vec<u8>> for Message {
    fn from(b: Vec<u8>) -> Self {
        Message::Binary(b)
    }
}

/// Why the assembler refused a frame. Each maps to a close code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    /// New message during a fragmented sequence, or a stray continuation.
    Protocol(&'static str),
    /// Total message size exceeded [`MAX_MESSAGE_SIZE`].
    TooLarge,
    /// Text message is not valid UTF-8.
    InvalidUtf8,
}

impl AssembleError {
    pub fn close_code(&self) -> u16 {
        match self {
            AssembleError::Protocol(_) => WsCloseCode::PROTOCOL_ERROR,
            AssembleError::TooLarge => WsCloseCode::MESSAGE_TOO_BIG,
            AssembleError::InvalidUtf8 => WsCloseCode::INVALID_DATA,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            AssembleError::Protocol(reason) => reason,
            AssembleError::TooLarge => "message too big",
            AssembleError::InvalidUtf8 => "invalid UTF-8",
        }
    }
}

/// Fragment reassembly state for one connection.
#[derive(Debug)]
pub struct MessageAssembler {
    /// Opcode of the first fragment. `None` = not in a fragment sequence.
    initial_opcode: Option<WsOpcode>,
    buffer: Vec<u8>,
    max_message_size: usize,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            initial_opcode: None,
            buffer: Vec::new(),
            max_message_size,
        }
    }

    pub fn is_assembling(&self) -> bool {
        self.initial_opcode.is_some()
    }

    fn reset(&mut self) {
        self.initial_opcode = None;
        self.buffer.clear();
    }

    /// Feed one data frame. Returns `Ok(Some(message))` once a message is
    /// complete and `Ok(None)` while fragments are still accumulating.
    pub fn push(&mut self, frame: WsFrame) -> Result<Option<Message>, AssembleError> {
        match frame.opcode {
            WsOpcode::Text | WsOpcode::Binary if self.is_assembling() => {
                self.reset();
                Err(AssembleError::Protocol("new message during fragmented sequence"))
            }
            WsOpcode::Text | WsOpcode::Binary if frame.payload.len() > self.max_message_size => {
                Err(AssembleError::TooLarge)
            }
            WsOpcode::Text | WsOpcode::Binary if frame.fin => finish(frame.opcode, frame.payload),
            WsOpcode::Text | WsOpcode::Binary => {
                self.initial_opcode = Some(frame.opcode);
                self.buffer = frame.payload;
                Ok(None)
            }
            WsOpcode::Continuation => {
                let Some(opcode) = self.initial_opcode else {
                    return Err(AssembleError::Protocol("unexpected continuation frame"));
                };
                if self.buffer.len() + frame.payload.len() > self.max_message_size {
                    self.reset();
                    return Err(AssembleError::TooLarge);
                }
                self.buffer.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                let payload = std::mem::take(&mut self.buffer);
                self.initial_opcode = None;
                finish(opcode, payload)
            }
            _ => Err(AssembleError::Protocol("unexpected opcode in reassembly")),
        }
    }
}

/// UTF-8 validation happens on the whole message, not individual fragments.
fn finish(opcode: WsOpcode, payload: Vec<u8>) -> Result<Option<Message>, AssembleError> {
    if opcode == WsOpcode::Binary {
        return Ok(Some(Message::Binary(payload)));
    }
    String::from_utf8(payload)
        .map(|text| Some(Message::Text(text)))
        .map_err(|_| AssembleError::InvalidUtf8)
}
