//! The jsonRWS application message.
//!
//! # Wire format
//!
//! Every TEXT frame exchanged with the relay carries exactly one JSON object:
//!
//! ```text
//! {"id":210129163129492100,"from":210129163129492001,"to":0,"cmd":"socket/sendall","payload":"hi"}
//! ```
//!
//! - `id`      – 18-digit message id, see [`super::id`].
//! - `from`    – socket id of the sender, `0` before the relay assigned one.
//! - `to`      – a socket id, a list of socket ids, a room name, or `0` for
//!               the relay itself.
//! - `cmd`     – the command, see [`Command`].
//! - `payload` – any JSON value; omitted entirely when there is none.
//!
//! Field order on the wire is always `id, from, to, cmd, payload`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced while decoding an inbound envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope must be a JSON object")]
    NotAnObject,

    #[error("envelope has no \"cmd\" string")]
    MissingCmd,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("unexpected payload for '{cmd}': expected {expected}")]
    UnexpectedPayload { cmd: String, expected: &'static str },
}

// ── Recipient ─────────────────────────────────────────────────────────────────

/// The `to` field.
///
/// Serialized untagged, so `Socket(7)` is `7`, `Sockets(vec![1,2])` is
/// `[1,2]` and `Room("lobby")` is `"lobby"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    Socket(u64),
    Sockets(Vec<u64>),
    Room(String),
}

impl Recipient {
    /// The relay itself (`to: 0`).
    pub const RELAY: Recipient = Recipient::Socket(0);
}

impl Default for Recipient {
    fn default() -> Self {
        Self::RELAY
    }
}

impl From<u64> for Recipient {
    fn from(id: u64) -> Self {
        Self::Socket(id)
    }
}

impl From<Vec<u64>> for Recipient {
    fn from(ids: Vec<u64>) -> Self {
        Self::Sockets(ids)
    }
}

impl From<&str> for Recipient {
    fn from(room: &str) -> Self {
        Self::Room(room.to_string())
    }
}

// ── Command ───────────────────────────────────────────────────────────────────

/// The closed command vocabulary understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    InfoSocketId,
    InfoSocketList,
    InfoRoomList,
    InfoRoomListMy,
    SocketSendOne,
    SocketSend,
    SocketBroadcast,
    SocketSendAll,
    SocketNick,
    RoomEnter,
    RoomExit,
    RoomExitAll,
    RoomSend,
    Route,
}

impl Command {
    pub const ALL: [Command; 14] = [
        Command::InfoSocketId,
        Command::InfoSocketList,
        Command::InfoRoomList,
        Command::InfoRoomListMy,
        Command::SocketSendOne,
        Command::SocketSend,
        Command::SocketBroadcast,
        Command::SocketSendAll,
        Command::SocketNick,
        Command::RoomEnter,
        Command::RoomExit,
        Command::RoomExitAll,
        Command::RoomSend,
        Command::Route,
    ];

    /// The string that goes into the `cmd` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::InfoSocketId => "info/socket/id",
            Command::InfoSocketList => "info/socket/list",
            Command::InfoRoomList => "info/room/list",
            Command::InfoRoomListMy => "info/room/listmy",
            Command::SocketSendOne => "socket/sendone",
            Command::SocketSend => "socket/send",
            Command::SocketBroadcast => "socket/broadcast",
            Command::SocketSendAll => "socket/sendall",
            Command::SocketNick => "socket/nick",
            Command::RoomEnter => "room/enter",
            Command::RoomExit => "room/exit",
            Command::RoomExitAll => "room/exitall",
            Command::RoomSend => "room/send",
            Command::Route => "route",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownCommand(s.to_string()))
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One jsonRWS message.
///
/// `cmd` is kept as a plain string so that envelopes carrying commands this
/// client does not know about can still be delivered as `Message` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub from: u64,
    #[serde(default)]
    pub to: Recipient,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Builds an outgoing envelope.
    pub fn new(id: u64, from: u64, to: impl Into<Recipient>, cmd: Command, payload: Option<Value>) -> Self {
        Self {
            id,
            from,
            to: to.into(),
            cmd: cmd.as_str().to_string(),
            payload,
        }
    }

    /// The parsed command, or `None` for commands outside the vocabulary.
    pub fn command(&self) -> Option<Command> {
        self.cmd.parse().ok()
    }

    pub fn is_route(&self) -> bool {
        self.command() == Some(Command::Route)
    }
}

/// Serializes an envelope to its wire JSON.
///
/// # Errors
///
/// Returns [`EnvelopeError::Json`] if the payload cannot be serialized.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, EnvelopeError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parses wire JSON into an [`Envelope`].
///
/// # Errors
///
/// - [`EnvelopeError::Json`] for malformed JSON or mistyped fields.
/// - [`EnvelopeError::NotAnObject`] when the top-level value is not an object.
/// - [`EnvelopeError::MissingCmd`] when `cmd` is absent or not a string.
pub fn decode_envelope(text: &str) -> Result<Envelope, EnvelopeError> {
    let value: Value = serde_json::from_str(text)?;
    let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
    if !object.get("cmd").map(Value::is_string).unwrap_or(false) {
        return Err(EnvelopeError::MissingCmd);
    }
    Ok(serde_json::from_value(value)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
