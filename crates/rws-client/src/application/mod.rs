//! Application layer for the client.
//!
//! - **`client`** – [`client::RwsClient`], the facade applications use:
//!   connect, ask questions, send messages, dispatch routes.
//! - **`correlator`** – matches inbound envelopes to pending questions by
//!   command name.
//! - **`events`** – [`events::ClientEvent`] and the subscriber fan-out.

pub mod client;
pub mod correlator;
pub mod events;
