//! Event fan-out to application subscribers.
//!
//! Every subscriber owns an unbounded `mpsc` receiver.  [`EventDistributor::emit`]
//! walks the subscribers in registration order and pushes a clone of the
//! event into each channel, so:
//!
//! - all subscribers see every event, in the order the read loop produced it;
//! - a slow subscriber never blocks the read loop or the other subscribers;
//! - a subscriber unsubscribes simply by dropping its receiver.

use std::sync::{Mutex, PoisonError};

use rws_core::Envelope;
use tokio::sync::mpsc;
use tracing::trace;

/// Everything a client application can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The upgrade succeeded (initially or after a reconnect).
    Connected {
        socket_id: u64,
        subprotocol: Option<String>,
    },
    /// The relay sent a CLOSE frame.
    ClosedByServer,
    Ping,
    Pong,
    /// An envelope that did not answer a pending question.
    Message(Envelope),
    /// Inbound text that could not be decoded as an envelope.
    MessageError { raw: String, error: String },
    /// An envelope with `cmd == "route"`.
    Route(Envelope),
    /// The transport went away.
    Disconnected { reconnecting: bool },
    /// A transport failure that stopped reconnection.
    TransportError(String),
}

/// Registration-ordered list of subscriber channels.
#[derive(Debug, Default)]
pub struct EventDistributor {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ClientEvent>>>,
}

impl EventDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.  It receives events emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Delivers `event` to every live subscriber; subscribers whose receiver
    /// was dropped are removed.
    pub fn emit(&self, event: ClientEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        trace!(subscribers = subscribers.len(), ?event, "emitting event");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
