use mqttkit_protocol::{ConnAck, Message, SubscribeReturnCode};

use crate::error::MqttError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications a `Session` emits, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StateChanged(ConnectionState),
    /// The broker accepted the connection.
    Connected,
    /// The connection ended. `None` when the application asked for it.
    Disconnected(Option<MqttError>),
    ConnAck(ConnAck),
    Message(Message),
    Subscribed {
        topics: Vec<String>,
        granted: Vec<SubscribeReturnCode>,
    },
    Unsubscribed {
        topics: Vec<String>,
    },
}
