//! mqttkit_session
//!
//! The client side of an MQTT 3.1.1 session: connection lifecycle, QoS 1/2
//! delivery with retransmission, keepalive probing and automatic reconnect.
//! The session is generic over a `Connector`, so the same engine runs over
//! TCP, TLS or an in-memory pipe.
//!
//! Public types:
//! - `Session`: handle used to connect, publish, subscribe and disconnect.
//! - `Options`: everything a session is configured with.
//! - `Event`: notifications delivered on the session's event channel.
//! - `Delivery` / `SessionState`: the I/O-free engine underneath.

pub mod delivery;
pub mod error;
pub mod event;
pub mod keepalive;
pub mod options;
pub mod session;
pub mod state;

pub use delivery::Delivery;
pub use error::MqttError;
pub use event::{ConnectionState, Event};
pub use keepalive::KeepAlive;
pub use options::{Options, generate_client_id};
pub use session::Session;
pub use state::{Close, Outcome, SessionState};

#[cfg(test)]
mod tests;
