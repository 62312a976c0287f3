//! Error type shared by the client's network driver and public facade.

use std::io;

use rws_core::{EnvelopeError, HandshakeError, ProtocolError};
use thiserror::Error;

use crate::infrastructure::network::state::{ConnectionState, InvalidTransition};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The relay's upgrade response failed validation.  Never retried.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("websocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("message error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("no answer for the question: {cmd}")]
    Timeout { cmd: String },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("connection handle is stale (issued for generation {handle}, current is {current})")]
    StaleHandle { handle: u64, current: u64 },

    #[error("not connected")]
    NotConnected,
}

impl From<InvalidTransition> for ClientError {
    fn from(t: InvalidTransition) -> Self {
        ClientError::InvalidState {
            operation: t.operation,
            state: t.state,
        }
    }
}

impl ClientError {
    /// Failures after which the reconnect loop gives up immediately: a bad
    /// upgrade, a framing error or any I/O failure other than a refused
    /// connection.
    pub fn is_fatal_for_reconnect(&self) -> bool {
        matches!(self, ClientError::Handshake(_) | ClientError::Protocol(_)) || self.transport_failure().is_some()
    }

    /// The I/O error behind a transport failure, unless the relay simply
    /// refused the connection.
    pub fn transport_failure(&self) -> Option<&io::Error> {
        match self {
            ClientError::Transport(e) if e.kind() != io::ErrorKind::ConnectionRefused => Some(e),
            _ => None,
        }
    }
}
