//! Control packet model
//!
//! `Packet` is the in-memory form of every MQTT 3.1.1 control packet. Each
//! variant carries only the fields its type defines; the fixed header flags
//! are derived from those fields when encoding, so a packet can never carry
//! flags that disagree with its content.
//!
//! Body (variable header + payload) reading and writing lives here; framing
//! (the fixed header and remaining length) lives in `codec`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{read_mqtt_bytes, read_mqtt_string, read_u8, read_u16, write_mqtt_bytes, write_mqtt_string};
use crate::error::ProtocolError;

/// Protocol name carried in every CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

const CONNECT_CLEAN_SESSION: u8 = 0b0000_0010;
const CONNECT_WILL: u8 = 0b0000_0100;
const CONNECT_WILL_RETAIN: u8 = 0b0010_0000;
const CONNECT_PASSWORD: u8 = 0b0100_0000;
const CONNECT_USERNAME: u8 = 0b1000_0000;

const PUBLISH_RETAIN: u8 = 0b0000_0001;
const PUBLISH_QOS: u8 = 0b0000_0110;
const PUBLISH_DUP: u8 = 0b0000_1000;

const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

impl PacketType {
    /// Packet type from the high nibble of a fixed header byte. Nibbles 0 and
    /// 15 are reserved and yield `None`.
    pub fn from_header(header: u8) -> Option<Self> {
        let packet_type = match header >> 4 {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            _ => return None,
        };
        Some(packet_type)
    }
}

/// Quality of Service levels for MQTT messages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,
    /// At least once delivery.
    AtLeastOnce = 1,
    /// Exactly once delivery.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ProtocolError::InvalidQoS(other)),
        }
    }
}

/// Message the broker publishes on the client's behalf after an ungraceful
/// disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_level: u8,
    pub clean_session: bool,
    /// Keepalive interval in seconds. 0 disables keepalive.
    pub keep_alive: u16,
    pub client_id: String,
    pub last_will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_level: PROTOCOL_LEVEL,
            clean_session: true,
            keep_alive: 10,
            client_id: client_id.into(),
            last_will: None,
            username: None,
            password: None,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_session {
            flags |= CONNECT_CLEAN_SESSION;
        }
        if let Some(will) = &self.last_will {
            flags |= CONNECT_WILL;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= CONNECT_WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= CONNECT_USERNAME;
        }
        if self.password.is_some() {
            flags |= CONNECT_PASSWORD;
        }
        flags
    }

    fn write(&self, body: &mut BytesMut) -> Result<(), ProtocolError> {
        write_mqtt_string(body, PROTOCOL_NAME)?;
        body.put_u8(self.protocol_level);
        body.put_u8(self.flags());
        body.put_u16(self.keep_alive);

        // Payload order is fixed: client id, will, username, password.
        write_mqtt_string(body, &self.client_id)?;
        if let Some(will) = &self.last_will {
            write_mqtt_string(body, &will.topic)?;
            write_mqtt_bytes(body, &will.message)?;
        }
        if let Some(username) = &self.username {
            write_mqtt_string(body, username)?;
        }
        if let Some(password) = &self.password {
            write_mqtt_bytes(body, password)?;
        }
        Ok(())
    }

    fn read(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let name = read_mqtt_string(body)?;
        if name != PROTOCOL_NAME {
            return Err(ProtocolError::MalformedPacket(format!(
                "unexpected protocol name {name:?}"
            )));
        }
        let protocol_level = read_u8(body)?;
        let flags = read_u8(body)?;
        let keep_alive = read_u16(body)?;
        let client_id = read_mqtt_string(body)?;

        let last_will = if flags & CONNECT_WILL != 0 {
            let topic = read_mqtt_string(body)?;
            let message = read_mqtt_bytes(body)?;
            Some(LastWill {
                topic,
                message,
                qos: QoS::try_from((flags >> 3) & 0b11)?,
                retain: flags & CONNECT_WILL_RETAIN != 0,
            })
        } else {
            None
        };
        let username = if flags & CONNECT_USERNAME != 0 {
            Some(read_mqtt_string(body)?)
        } else {
            None
        };
        let password = if flags & CONNECT_PASSWORD != 0 {
            Some(read_mqtt_bytes(body)?)
        } else {
            None
        };

        Ok(Self {
            protocol_level,
            clean_session: flags & CONNECT_CLEAN_SESSION != 0,
            keep_alive,
            client_id,
            last_will,
            username,
            password,
        })
    }
}

/// CONNACK return codes. Values outside the defined range are kept as
/// `Reserved` so they can still be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
    Reserved(u8),
}

impl From<u8> for ConnectReturnCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUsernameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            other => ConnectReturnCode::Reserved(other),
        }
    }
}

impl From<ConnectReturnCode> for u8 {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUsernameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Reserved(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

impl ConnAck {
    pub fn new(code: ConnectReturnCode, session_present: bool) -> Self {
        Self {
            session_present,
            code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Packet identifier. Only carried on the wire when `qos` is above 0.
    pub pkid: u16,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            pkid: 0,
            payload: payload.into(),
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= PUBLISH_DUP;
        }
        if self.retain {
            flags |= PUBLISH_RETAIN;
        }
        flags
    }

    fn write(&self, body: &mut BytesMut) -> Result<(), ProtocolError> {
        write_mqtt_string(body, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            body.put_u16(self.pkid);
        }
        body.extend_from_slice(&self.payload);
        Ok(())
    }

    fn read(header: u8, body: &mut Bytes) -> Result<Self, ProtocolError> {
        let qos = QoS::try_from((header & PUBLISH_QOS) >> 1)?;
        let topic = read_mqtt_string(body)?;
        let pkid = match qos {
            QoS::AtMostOnce => 0,
            _ => read_u16(body)?,
        };

        Ok(Self {
            dup: header & PUBLISH_DUP != 0,
            qos,
            retain: header & PUBLISH_RETAIN != 0,
            topic,
            pkid,
            payload: body.split_to(body.len()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

impl SubscribeFilter {
    pub fn new(path: impl Into<String>, qos: QoS) -> Self {
        Self {
            path: path.into(),
            qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

impl Subscribe {
    fn write(&self, body: &mut BytesMut) -> Result<(), ProtocolError> {
        body.put_u16(self.pkid);
        for filter in &self.filters {
            write_mqtt_string(body, &filter.path)?;
            body.put_u8(filter.qos as u8);
        }
        Ok(())
    }

    fn read(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let pkid = read_u16(body)?;
        let mut filters = Vec::new();
        while body.has_remaining() {
            let path = read_mqtt_string(body)?;
            let qos = QoS::try_from(read_u8(body)? & 0b11)?;
            filters.push(SubscribeFilter { path, qos });
        }
        if filters.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "SUBSCRIBE without topic filters".to_string(),
            ));
        }
        Ok(Self { pkid, filters })
    }
}

/// Per-filter result carried in a SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl From<SubscribeReturnCode> for u8 {
    fn from(code: SubscribeReturnCode) -> Self {
        match code {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => SUBACK_FAILURE,
        }
    }
}

impl TryFrom<u8> for SubscribeReturnCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            SUBACK_FAILURE => Ok(SubscribeReturnCode::Failure),
            other => QoS::try_from(other).map(SubscribeReturnCode::Success),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

impl SubAck {
    fn write(&self, body: &mut BytesMut) {
        body.put_u16(self.pkid);
        for code in &self.return_codes {
            body.put_u8(u8::from(*code));
        }
    }

    fn read(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let pkid = read_u16(body)?;
        if !body.has_remaining() {
            return Err(ProtocolError::MalformedPacket(
                "SUBACK without return codes".to_string(),
            ));
        }
        let return_codes = body
            .iter()
            .map(|byte| SubscribeReturnCode::try_from(*byte))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { pkid, return_codes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

impl Unsubscribe {
    fn write(&self, body: &mut BytesMut) -> Result<(), ProtocolError> {
        body.put_u16(self.pkid);
        for topic in &self.topics {
            write_mqtt_string(body, topic)?;
        }
        Ok(())
    }

    fn read(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let pkid = read_u16(body)?;
        let mut topics = Vec::new();
        while body.has_remaining() {
            topics.push(read_mqtt_string(body)?);
        }
        if topics.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "UNSUBSCRIBE without topic filters".to_string(),
            ));
        }
        Ok(Self { pkid, topics })
    }
}

/// An MQTT 3.1.1 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet identifier, for the types that carry one.
    pub fn pkid(&self) -> Option<u16> {
        match self {
            Packet::Publish(publish) if publish.qos != QoS::AtMostOnce => Some(publish.pkid),
            Packet::PubAck(pkid)
            | Packet::PubRec(pkid)
            | Packet::PubRel(pkid)
            | Packet::PubComp(pkid)
            | Packet::UnsubAck(pkid) => Some(*pkid),
            Packet::Subscribe(subscribe) => Some(subscribe.pkid),
            Packet::SubAck(suback) => Some(suback.pkid),
            Packet::Unsubscribe(unsubscribe) => Some(unsubscribe.pkid),
            _ => None,
        }
    }

    /// Topic of a PUBLISH, or the first filter of a SUBSCRIBE/UNSUBSCRIBE.
    pub fn topic(&self) -> Option<&str> {
        match self {
            Packet::Publish(publish) => Some(&publish.topic),
            Packet::Subscribe(subscribe) => subscribe.filters.first().map(|f| f.path.as_str()),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.topics.first().map(String::as_str),
            _ => None,
        }
    }

    /// Fixed header byte: type nibble plus flags.
    pub(crate) fn header(&self) -> u8 {
        let flags = match self {
            Packet::Publish(publish) => publish.flags(),
            Packet::PubRel(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) => 0b0010,
            _ => 0,
        };
        ((self.packet_type() as u8) << 4) | flags
    }

    /// Writes the variable header and payload.
    pub(crate) fn write_body(&self, body: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Packet::Connect(connect) => connect.write(body)?,
            Packet::ConnAck(connack) => {
                body.put_u8(connack.session_present as u8);
                body.put_u8(u8::from(connack.code));
            }
            Packet::Publish(publish) => publish.write(body)?,
            Packet::PubAck(pkid)
            | Packet::PubRec(pkid)
            | Packet::PubRel(pkid)
            | Packet::PubComp(pkid)
            | Packet::UnsubAck(pkid) => body.put_u16(*pkid),
            Packet::Subscribe(subscribe) => subscribe.write(body)?,
            Packet::SubAck(suback) => suback.write(body),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.write(body)?,
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
        }
        Ok(())
    }

    /// Builds a packet from its fixed header byte and complete body.
    pub(crate) fn read(header: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        let Some(packet_type) = PacketType::from_header(header) else {
            return Err(ProtocolError::MalformedPacket(format!(
                "unknown packet type in header {header:#04x}"
            )));
        };

        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(&mut body)?),
            PacketType::ConnAck => {
                let flags = read_u8(&mut body)?;
                let code = read_u8(&mut body)?;
                Packet::ConnAck(ConnAck {
                    session_present: flags & 0x01 != 0,
                    code: ConnectReturnCode::from(code),
                })
            }
            PacketType::Publish => Packet::Publish(Publish::read(header, &mut body)?),
            PacketType::PubAck => Packet::PubAck(read_u16(&mut body)?),
            PacketType::PubRec => Packet::PubRec(read_u16(&mut body)?),
            PacketType::PubRel => Packet::PubRel(read_u16(&mut body)?),
            PacketType::PubComp => Packet::PubComp(read_u16(&mut body)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(&mut body)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(&mut body)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(&mut body)?),
            PacketType::UnsubAck => Packet::UnsubAck(read_u16(&mut body)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
        };
        Ok(packet)
    }
}
