//! mqttkit_protocol
//!
//! MQTT 3.1.1 wire protocol: the control packet model, the binary codec and
//! the topic filter matcher. Nothing in this crate performs I/O; the decoder
//! works on whatever bytes the caller has read so far.
//!
//! Public types:
//! - `Packet`: every control packet as a tagged variant.
//! - `Decoder`: incremental, resynchronizing packet decoder.
//! - `Message`: application message as published or received.
//! - `matches`: topic filter matching.

pub mod codec;
pub mod error;
pub mod message;
pub mod packet;
pub mod topic;

pub use codec::{
    Decoder, MAX_BODY_RESERVE, MAX_REMAINING_LENGTH, read_remaining_length,
    write_remaining_length,
};
pub use error::ProtocolError;
pub use message::Message;
pub use packet::{
    ConnAck, Connect, ConnectReturnCode, LastWill, PROTOCOL_LEVEL, PROTOCOL_NAME, Packet,
    PacketType, Publish, QoS, SubAck, Subscribe, SubscribeFilter, SubscribeReturnCode,
    Unsubscribe,
};
pub use topic::{matches, valid_topic_filter, valid_topic_name};
