//! # rws-core
//!
//! Shared protocol library for the jsonRWS websocket client: the RFC 6455
//! frame codec, the client side of the opening handshake, the jsonRWS message
//! envelope, and the URI router used by the `route` command.
//!
//! This crate has zero dependencies on sockets or async runtimes.  Everything
//! here works on byte slices and strings so it can be tested in isolation.
//!
//! # Architecture overview (for beginners)
//!
//! A websocket connection starts life as an ordinary HTTP request carrying an
//! `Upgrade: websocket` header.  Once the relay answers with `101 Switching
//! Protocols`, both peers stop speaking HTTP and exchange *frames*: small
//! binary packets with a 2-4 byte header followed by the payload.
//!
//! - **`protocol::frame`** – How frames look on the wire.  Text payloads are
//!   wrapped into frames on the way out and unwrapped on the way in.
//!
//! - **`protocol::handshake`** – The HTTP upgrade exchange: building the
//!   request and proving that the relay really speaks websocket.
//!
//! - **`protocol::envelope`** – The jsonRWS application message
//!   `{id, from, to, cmd, payload}` that travels inside every text frame.
//!
//! - **`router`** – Matches URIs like `/user/:id` against the `uri` field of
//!   `route` messages and runs the registered handler.

pub mod protocol;
pub mod router;

// Re-export the most-used types at the crate root so callers can write
// `rws_core::Envelope` instead of `rws_core::protocol::envelope::Envelope`.
pub use protocol::envelope::{decode_envelope, encode_envelope, Command, Envelope, EnvelopeError, Recipient};
pub use protocol::frame::{decode_frame, decode_text, encode_control, encode_text, Frame, FrameDecoder, Opcode, ProtocolError};
pub use protocol::handshake::{compute_accept_key, validate_upgrade, HandshakeError, UpgradeRequest, UpgradeResponse, WsUrl};
pub use protocol::id::MessageIdGenerator;
pub use router::{DispatchOutcome, RouteError, RouteHandler, RouteTransaction, Router};
