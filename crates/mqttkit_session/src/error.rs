use mqttkit_protocol::{ConnectReturnCode, ProtocolError};
use mqttkit_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MqttError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("already connected or connecting")]
    AlreadyConnected,

    #[error("connection closed by broker")]
    ConnectionClosed,

    #[error("keepalive timeout: no response from broker")]
    KeepAliveTimeout,

    #[error("connection refused by broker: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("all packet identifiers are in flight")]
    PacketIdExhausted,

    #[error("invalid topic filter: {0:?}")]
    InvalidTopicFilter(String),

    #[error("invalid topic name: {0:?}")]
    InvalidTopicName(String),

    #[error("no topics given")]
    EmptyTopicList,
}
