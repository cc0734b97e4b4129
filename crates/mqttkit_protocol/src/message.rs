use bytes::Bytes;

use crate::packet::{LastWill, Publish, QoS};

/// Application message: what gets published and what subscribers receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// PUBLISH packet carrying this message under `pkid`.
    pub fn to_publish(&self, pkid: u16) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            pkid: if self.qos == QoS::AtMostOnce { 0 } else { pkid },
            payload: self.payload.clone(),
        }
    }
}

impl From<Publish> for Message {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

impl From<Message> for LastWill {
    fn from(message: Message) -> Self {
        Self {
            topic: message.topic,
            message: message.payload,
            qos: message.qos,
            retain: message.retain,
        }
    }
}
