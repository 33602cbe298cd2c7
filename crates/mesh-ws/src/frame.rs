//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! Frames are the smallest unit of WebSocket communication. The encoder turns
//! one payload into one frame; the decoder consumes an accumulating receive
//! buffer and yields frames as soon as they are complete, so transports may
//! deliver arbitrary chunk boundaries.
//!
//! - [`encode_frame`]: Build a frame (optionally masked) from a payload
//! - [`FrameDecoder`]: Incremental, restartable frame parser
//! - [`apply_mask`]: Symmetric XOR masking per RFC 6455 Section 5.3

use crate::error::{Result, WsError};

/// Maximum payload size (64 MiB) to prevent OOM from malicious 64-bit lengths.
pub const MAX_PAYLOAD_SIZE: u64 = 64 * 1024 * 1024;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcodes per RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsOpcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl WsOpcode {
    /// Parse a 4-bit opcode value into a `WsOpcode`.
    ///
    /// Reserved opcodes are a protocol error (RFC 6455 requires close with
    /// code 1002; the connection decides the response).
    pub fn from_u8(byte: u8) -> Result<WsOpcode> {
        match byte {
            0x0 => Ok(WsOpcode::Continuation),
            0x1 => Ok(WsOpcode::Text),
            0x2 => Ok(WsOpcode::Binary),
            0x8 => Ok(WsOpcode::Close),
            0x9 => Ok(WsOpcode::Ping),
            0xA => Ok(WsOpcode::Pong),
            _ => Err(WsError::protocol(format!("unknown opcode: 0x{:X}", byte))),
        }
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// A decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    /// FIN bit -- `true` if this is the final fragment of a message.
    pub fin: bool,
    /// The frame opcode (text, binary, close, ping, pong, continuation).
    pub opcode: WsOpcode,
    /// The unmasked payload bytes.
    pub payload: Vec<u8>,
}

/// Apply or remove the 4-byte XOR mask on a payload.
///
/// The operation is symmetric: applying the mask twice returns the original.
pub fn apply_mask(payload: &mut [u8], mask_key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Fresh random masking key for a client frame.
pub fn random_mask_key() -> [u8; 4] {
    rand::random()
}

/// Encode one frame.
///
/// `mask_key` is `Some` for client-to-server frames and `None` for
/// server-to-client frames. Uses the 7-bit, 16-bit or 64-bit payload length
/// encoding depending on payload size.
pub fn encode_frame(
    payload: &[u8],
    opcode: WsOpcode,
    mask_key: Option<[u8; 4]>,
    fin: bool,
) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 14);

    // Byte 0: FIN + opcode
    out.push(if fin { 0x80 } else { 0x00 } | (opcode as u8));

    // Byte 1: MASK + payload length
    let mask_bit = if mask_key.is_some() { 0x80 } else { 0x00 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 65535 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask_key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], &key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

// ---------------------------------------------------------------------------
// Incremental decoder
// ---------------------------------------------------------------------------

/// Which masking the decoder accepts on inbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Accept masked and unmasked frames (codec-level use and tests).
    Any,
    /// Every frame must be masked (server receiving from a client).
    Required,
    /// No frame may be masked (client receiving from a server).
    Forbidden,
}

/// Parsed fixed part of a frame header.
struct Header {
    fin: bool,
    opcode: WsOpcode,
    mask_key: Option<[u8; 4]>,
    payload_len: usize,
    header_len: usize,
}

/// Incremental frame parser over an accumulating receive buffer.
///
/// Bytes are appended with [`FrameDecoder::extend`]; [`FrameDecoder::next_frame`]
/// returns `Ok(None)` while the buffered bytes do not yet hold a whole frame,
/// leaving them in place until more data arrives. Frames come out in arrival
/// order.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    policy: MaskPolicy,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MaskPolicy::Any)
    }
}

impl FrameDecoder {
    pub fn new(policy: MaskPolicy) -> Self {
        Self {
            buf: Vec::new(),
            policy,
        }
    }

    /// Append received bytes to the buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Lazily decode every complete frame currently buffered.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { decoder: self }
    }

    /// Decode the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<WsFrame>> {
        let header = match self.parse_header()? {
            Some(h) => h,
            None => return Ok(None),
        };

        let total = header.header_len + header.payload_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut payload = self.buf[header.header_len..total].to_vec();
        self.buf.drain(..total);

        if let Some(key) = header.mask_key {
            apply_mask(&mut payload, &key);
        }

        Ok(Some(WsFrame {
            fin: header.fin,
            opcode: header.opcode,
            payload,
        }))
    }

    fn parse_header(&self) -> Result<Option<Header>> {
        // Byte 0: FIN(1) RSV(3) Opcode(4)
        // Byte 1: MASK(1) Payload-Length(7)
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];

        let fin = (b0 & 0x80) != 0;
        if (b0 >> 4) & 0x07 != 0 {
            return Err(WsError::protocol("non-zero RSV bits without negotiated extensions"));
        }
        let opcode = WsOpcode::from_u8(b0 & 0x0F)?;

        let masked = (b1 & 0x80) != 0;
        match (self.policy, masked) {
            (MaskPolicy::Required, false) => {
                return Err(WsError::protocol("client frame is not masked"));
            }
            (MaskPolicy::Forbidden, true) => {
                return Err(WsError::protocol("server frame must not be masked"));
            }
            _ => {}
        }

        let length_byte = b1 & 0x7F;
        let (payload_len, mut offset): (u64, usize) = match length_byte {
            0..=125 => (length_byte as u64, 2),
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64, 4)
            }
            _ => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(WsError::protocol("MSB of 64-bit length must be 0"));
                }
                (len, 10)
            }
        };

        if opcode.is_control() {
            if !fin {
                return Err(WsError::protocol("control frames must not be fragmented"));
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(WsError::protocol("control frame payload exceeds 125 bytes"));
            }
        }

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WsError::protocol(format!(
                "payload length {} exceeds maximum {}",
                payload_len, MAX_PAYLOAD_SIZE
            )));
        }

        let mask_key = if masked {
            if self.buf.len() < offset + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&self.buf[offset..offset + 4]);
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some(Header {
            fin,
            opcode,
            mask_key,
            payload_len: payload_len as usize,
            header_len: offset,
        }))
    }
}

/// Iterator over the complete frames currently buffered in a [`FrameDecoder`].
///
/// Stops at the first incomplete frame; a later call to
/// [`FrameDecoder::frames`] resumes where this one left off. After an error
/// the buffer is left as-is and the connection is expected to fail.
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<WsFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame().transpose()
    }
}
