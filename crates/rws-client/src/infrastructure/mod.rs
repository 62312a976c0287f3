//! Infrastructure layer for the client.
//!
//! # Sub-modules
//!
//! - **`network`** – TCP transport, the websocket upgrade, the frame read
//!   loop, the lifecycle state machine and automatic reconnection.
//!
//! - **`storage`** – TOML configuration file (relay URL, subprotocols,
//!   question timeout, reconnect policy, log level).

pub mod network;
pub mod storage;
