//! Pure connection lifecycle state machine.
//!
//! # States (for beginners)
//!
//! ```text
//!                 connect()                TCP up            101 + valid headers
//!  Disconnected ───────────▶ Connecting ─────────▶ AwaitingUpgrade ─────────▶ Connected
//!       ▲                        ▲                                              │  │
//!       │                        │ delay elapsed, attempt += 1                  │  │ disconnect()
//!       │                        │                                              │  ▼
//!       │                   Reconnecting ◀──── transport closed, attempt <= max ┘ Closing
//!       │                        │                                                 │
//!       └────────────────────────┴──── attempts exhausted / handshake failed ◀─────┘
//! ```
//!
//! This module contains no I/O.  The network driver calls one method per
//! observed fact ("TCP connected", "transport closed", …) and acts on the
//! returned decision, which keeps every transition unit-testable without a
//! socket.
//!
//! # Attempt counter
//!
//! `attempt` is reset to 1 whenever a connection is established.  When the
//! transport closes, a reconnect is scheduled only while `attempt <= max`;
//! each reconnect increments it.  Setting `attempt = max + 1` is how an
//! explicit disconnect (or a fatal transport error) suppresses reconnection.

use std::fmt;

/// Where the connection currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingUpgrade,
    Connected,
    Closing,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingUpgrade => "awaiting upgrade",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// A transition that is not allowed from the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub operation: &'static str,
    pub state: ConnectionState,
}

/// What the driver should do after the transport went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Wait `reconnect_delay`, then call [`Lifecycle::begin_reconnect_attempt`].
    Reconnect,
    /// Stay disconnected.
    Stop,
    /// The closed transport belonged to an older generation; ignore it.
    Stale,
}

/// The lifecycle bookkeeping for one client connection.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    attempt: u32,
    max_attempts: u32,
    generation: u64,
    shut_down: bool,
}

impl Lifecycle {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 1,
            max_attempts,
            generation: 0,
            shut_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Generation of the most recently established transport (0 = never).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn reject(&self, operation: &'static str) -> InvalidTransition {
        InvalidTransition {
            operation,
            state: self.state,
        }
    }

    // ── Connecting ────────────────────────────────────────────────────────────

    /// User-initiated `connect()`.  Only allowed from `Disconnected` and not
    /// after shutdown.
    pub fn begin_connect(&mut self) -> Result<(), InvalidTransition> {
        if self.shut_down || self.state != ConnectionState::Disconnected {
            return Err(self.reject("connect"));
        }
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// The TCP connection is up; the upgrade request goes out next.
    pub fn tcp_connected(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::AwaitingUpgrade;
        }
    }

    /// The relay accepted the upgrade.  Resets the attempt counter and returns
    /// the generation number of the new transport.
    pub fn upgrade_complete(&mut self) -> u64 {
        self.state = ConnectionState::Connected;
        self.attempt = 1;
        self.generation += 1;
        self.generation
    }

    /// The user-initiated connect failed before reaching `Connected`.
    pub fn connect_failed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    // ── Closing ───────────────────────────────────────────────────────────────

    /// User-initiated `disconnect()`.  Only allowed from `Connected`.
    pub fn begin_close(&mut self) -> Result<u64, InvalidTransition> {
        if self.state != ConnectionState::Connected {
            return Err(self.reject("disconnect"));
        }
        self.state = ConnectionState::Closing;
        self.suppress_reconnect();
        Ok(self.generation)
    }

    /// The CLOSE frame has been sent and the transport torn down.
    pub fn finish_close(&mut self) {
        if self.state == ConnectionState::Closing {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Makes the next close decision `Stop`.
    pub fn suppress_reconnect(&mut self) {
        self.attempt = self.max_attempts.saturating_add(1);
    }

    /// Terminal shutdown.  Returns `true` the first time it is called.
    pub fn shut_down(&mut self) -> bool {
        let first = !self.shut_down;
        self.shut_down = true;
        self.suppress_reconnect();
        if self.state == ConnectionState::Reconnecting {
            self.state = ConnectionState::Disconnected;
        }
        first
    }

    // ── Reconnecting ──────────────────────────────────────────────────────────

    /// The transport of `generation` closed (EOF, CLOSE frame, protocol error
    /// or I/O error).
    pub fn transport_closed(&mut self, generation: u64) -> CloseDecision {
        if generation != self.generation {
            return CloseDecision::Stale;
        }
        match self.state {
            ConnectionState::Connected if self.reconnect_allowed() => {
                self.state = ConnectionState::Reconnecting;
                CloseDecision::Reconnect
            }
            ConnectionState::Connected | ConnectionState::Closing => {
                self.state = ConnectionState::Disconnected;
                CloseDecision::Stop
            }
            _ => CloseDecision::Stop,
        }
    }

    /// The reconnect delay elapsed.  Returns `false` when reconnection was
    /// cancelled in the meantime.
    pub fn begin_reconnect_attempt(&mut self) -> bool {
        if self.state != ConnectionState::Reconnecting || self.shut_down {
            return false;
        }
        self.attempt += 1;
        self.state = ConnectionState::Connecting;
        true
    }

    /// A reconnect attempt failed.  `fatal` is set for failures that never
    /// retry (handshake, protocol, non-refused I/O); it also pushes `attempt`
    /// past the maximum.  Returns `true` when another attempt should follow.
    pub fn reconnect_failed(&mut self, fatal: bool) -> bool {
        if fatal {
            self.suppress_reconnect();
        }
        if self.reconnect_allowed() {
            self.state = ConnectionState::Reconnecting;
            true
        } else {
            self.state = ConnectionState::Disconnected;
            false
        }
    }

    fn reconnect_allowed(&self) -> bool {
        !self.shut_down && self.attempt <= self.max_attempts
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
