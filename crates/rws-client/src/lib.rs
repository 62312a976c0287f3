//! rws-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does rws-client do? (for beginners)
//!
//! A *relay* server accepts many websocket clients.  Every client gets a
//! numeric *socket id*; clients talk to each other by sending small JSON
//! *envelopes* to the relay, which forwards them to one socket, a list of
//! sockets, a room, or everybody.
//!
//! The client:
//!
//! 1. Opens a TCP connection and upgrades it to a websocket, offering the
//!    `jsonRWS` subprotocol.  The relay tells us our socket id in the
//!    upgrade response.
//! 2. Reads frames continuously and turns them into [`ClientEvent`]s:
//!    messages, route requests, ping/pong, close and disconnect notices.
//! 3. Sends envelopes on behalf of the application (`send_one`,
//!    `room_send`, `route`, …) and answers "questions" such as
//!    `info/socket/list` by waiting for the relay's reply.
//! 4. Reconnects automatically after the relay drops the connection, up to
//!    a configured number of attempts.

pub mod application;
pub mod error;
pub mod infrastructure;

pub use application::client::{RoomInfo, RwsClient};
pub use application::events::ClientEvent;
pub use error::ClientError;
pub use infrastructure::network::state::ConnectionState;
pub use infrastructure::network::ConnectionHandle;
pub use infrastructure::storage::config::{ClientConfig, ConnectionConfig, LoggingConfig};
