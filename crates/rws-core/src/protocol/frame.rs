//! Binary codec for RFC 6455 websocket frames.
//!
//! Wire format (RFC 6455 section 5.2):
//! ```text
//! byte 0: [fin:1][rsv1:1][rsv2:1][rsv3:1][opcode:4]
//! byte 1: [mask:1][payload_len:7]
//! payload_len == 126  ->  2 more bytes, big-endian u16 true length
//! payload_len == 127  ->  8 more bytes, big-endian u64 (not supported here)
//! [payload:N]
//! ```
//!
//! This client never fragments and never masks: every frame it writes carries
//! `fin = 1` and `mask = 0`, and it expects the relay to do the same.  Payloads
//! larger than 65 535 bytes are rejected explicitly on both paths instead of
//! being truncated.

use thiserror::Error;

/// Largest payload that fits directly in the 7-bit length field.
pub const MAX_SMALL_PAYLOAD: usize = 125;

/// Largest payload that fits in the 16-bit extended length field.
pub const MAX_MEDIUM_PAYLOAD: usize = 0xFFFF;

/// Size of the fixed part of every frame header (byte 0 + byte 1).
pub const BASE_HEADER_SIZE: usize = 2;

const FIN_BIT: u8 = 0b1000_0000;
const OPCODE_BITS: u8 = 0b0000_1111;
const MASK_BIT: u8 = 0b1000_0000;
const LEN_BITS: u8 = 0b0111_1111;
const LEN_16_MARKER: u8 = 126;
const LEN_64_MARKER: u8 = 127;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The buffer does not yet hold a complete frame.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The opcode nibble is not one this client understands.
    #[error("unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// `fin = 0`: the peer sent a fragment, which this client does not reassemble.
    #[error("fragmented frames are not supported")]
    FragmentedFrame,

    /// The relay masked a frame it sent to the client.
    #[error("server-to-client frames must not be masked")]
    MaskedFrame,

    /// The frame uses the 64-bit extended length form.
    #[error("64-bit extended payload length is not supported")]
    UnsupportedLength,

    /// An outgoing payload does not fit into the 16-bit length field.
    #[error("payload of {0} bytes exceeds the 65535 byte limit")]
    PayloadTooLarge(usize),

    /// A text payload was not valid UTF-8.
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,

    /// The frame carried the CLOSE opcode instead of data.
    #[error("websocket connection closed by the peer (opcode 0x8)")]
    ClosedByPeer,
}

/// The 4-bit frame type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Control frames (CLOSE, PING, PONG) carry no application data.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// A single decoded websocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Length of the payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Consumes the frame and returns its payload as a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ClosedByPeer`] for CLOSE frames and
    /// [`ProtocolError::InvalidUtf8`] if the payload is not valid text.
    pub fn into_text(self) -> Result<String, ProtocolError> {
        if self.opcode == Opcode::Close {
            return Err(ProtocolError::ClosedByPeer);
        }
        String::from_utf8(self.payload).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `text` into a single unmasked TEXT frame.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] when the UTF-8 encoding of
/// `text` is longer than 65 535 bytes.
///
/// # Examples
///
/// ```rust
/// use rws_core::protocol::frame::{decode_text, encode_text};
///
/// let bytes = encode_text("hello").unwrap();
/// assert_eq!(bytes[0], 0b1000_0001);
/// assert_eq!(decode_text(&bytes).unwrap(), "hello");
/// ```
pub fn encode_text(text: &str) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(Opcode::Text, text.as_bytes())
}

/// Encodes a zero-length control frame (PING, PONG or CLOSE).
pub fn encode_control(opcode: Opcode) -> Vec<u8> {
    vec![FIN_BIT | opcode as u8, 0x00]
}

/// Encodes an arbitrary unmasked, final frame.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] for payloads over 65 535 bytes.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = payload.len();
    if len > MAX_MEDIUM_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }

    let mut buf = Vec::with_capacity(BASE_HEADER_SIZE + 2 + len);
    buf.push(FIN_BIT | opcode as u8);
    if len <= MAX_SMALL_PAYLOAD {
        // mask bit stays 0
        buf.push(len as u8);
    } else {
        buf.push(LEN_16_MARKER);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    }
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the total number of bytes consumed (header +
/// payload) so the caller can advance its read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] while the frame is still
/// incomplete; any other variant means the stream is corrupt.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    if bytes.len() < BASE_HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: BASE_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let byte_1 = bytes[0];
    let byte_2 = bytes[1];

    let fin = byte_1 & FIN_BIT != 0;
    let opcode = Opcode::try_from(byte_1 & OPCODE_BITS)?;
    if !fin {
        return Err(ProtocolError::FragmentedFrame);
    }

    let masked = byte_2 & MASK_BIT != 0;
    if masked {
        return Err(ProtocolError::MaskedFrame);
    }

    let (payload_len, header_len) = match byte_2 & LEN_BITS {
        LEN_64_MARKER => return Err(ProtocolError::UnsupportedLength),
        LEN_16_MARKER => {
            let header_len = BASE_HEADER_SIZE + 2;
            if bytes.len() < header_len {
                return Err(ProtocolError::InsufficientData {
                    needed: header_len,
                    available: bytes.len(),
                });
            }
            (u16::from_be_bytes([bytes[2], bytes[3]]) as usize, header_len)
        }
        small => (small as usize, BASE_HEADER_SIZE),
    };

    let total = header_len + payload_len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let frame = Frame {
        fin,
        opcode,
        masked,
        payload: bytes[header_len..total].to_vec(),
    };
    Ok((frame, total))
}

/// Decodes one frame and returns its payload text.
///
/// # Errors
///
/// Raises [`ProtocolError::ClosedByPeer`] when the frame is a CLOSE frame,
/// plus every error [`decode_frame`] can produce.
pub fn decode_text(bytes: &[u8]) -> Result<String, ProtocolError> {
    let (frame, _) = decode_frame(bytes)?;
    frame.into_text()
}

// ── Streaming reassembly ──────────────────────────────────────────────────────

/// Accumulates bytes from a stream transport and yields complete frames.
///
/// A single socket read may deliver half a frame or several frames at once.
/// Bytes are appended with [`FrameDecoder::extend`] and drained one frame at a
/// time by [`FrameDecoder::next_frame`], which returns `Ok(None)` while the
/// next frame is still incomplete.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
        }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Removes and returns the next complete frame, if any.
    ///
    /// # Errors
    ///
    /// Returns the [`ProtocolError`] for a corrupt frame.  The buffer is left
    /// untouched in that case; the connection should be dropped.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        match decode_frame(&self.buf) {
            Ok((frame, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            Err(ProtocolError::InsufficientData { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
