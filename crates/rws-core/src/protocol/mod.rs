//! Protocol module containing the frame codec, handshake, and jsonRWS envelope.

pub mod envelope;
pub mod frame;
pub mod handshake;
pub mod id;

pub use envelope::{decode_envelope, encode_envelope, Command, Envelope, EnvelopeError, Recipient};
pub use frame::{decode_frame, decode_text, encode_control, encode_text, Frame, FrameDecoder, Opcode, ProtocolError};
pub use handshake::{compute_accept_key, validate_upgrade, HandshakeError, UpgradeRequest, UpgradeResponse, WsUrl};
pub use id::MessageIdGenerator;

/// The only websocket protocol version this client speaks.
pub const WEBSOCKET_VERSION: u8 = 13;

/// The application subprotocol offered during the handshake.
pub const SUBPROTOCOL_JSON_RWS: &str = "jsonRWS";
