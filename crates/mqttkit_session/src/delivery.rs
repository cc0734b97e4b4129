//! QoS delivery engine
//!
//! Tracks every packet that is waiting for the broker to complete a
//! handshake. Outgoing entries are keyed by identifiers this client chose
//! (PUBLISH at QoS 1/2, PUBREL, SUBSCRIBE, UNSUBSCRIBE); incoming entries are
//! keyed by identifiers the broker chose for QoS 2 messages we have answered
//! with PUBREC. The two identifier spaces are independent on the wire, so
//! they are kept apart here too.
//!
//! Nothing in this module does I/O. Handlers return the reply to send, if
//! any, and the caller writes it.

use std::collections::{BTreeMap, BTreeSet};

use mqttkit_protocol::{Message, Packet, Publish, QoS, Subscribe, SubscribeFilter, Unsubscribe};
use tracing::debug;

use crate::error::MqttError;

#[derive(Debug, Clone)]
struct Entry {
    packet: Packet,
    /// Set once the packet has been handed to a link. A PUBLISH that never
    /// went out is not a duplicate when it is first sent.
    sent: bool,
}

#[derive(Debug, Default)]
pub struct Delivery {
    last_pkid: u16,
    outgoing: BTreeMap<u16, Entry>,
    incoming: BTreeSet<u16>,
}

impl Delivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next free packet identifier. Wraps past 65535, never returns 0 and
    /// skips identifiers still in flight.
    pub fn next_pkid(&mut self) -> Result<u16, MqttError> {
        for _ in 0..u16::MAX {
            self.last_pkid = self.last_pkid.wrapping_add(1);
            if self.last_pkid == 0 {
                self.last_pkid = 1;
            }
            if !self.outgoing.contains_key(&self.last_pkid) {
                return Ok(self.last_pkid);
            }
        }
        Err(MqttError::PacketIdExhausted)
    }

    fn track(&mut self, pkid: u16, packet: Packet) {
        self.outgoing.insert(
            pkid,
            Entry {
                packet,
                sent: false,
            },
        );
    }

    /// Builds the PUBLISH for `message`. QoS 1 and 2 messages get an
    /// identifier and stay pending until their handshake completes.
    pub fn publish(&mut self, message: &Message) -> Result<Publish, MqttError> {
        if message.qos == QoS::AtMostOnce {
            return Ok(message.to_publish(0));
        }
        let pkid = self.next_pkid()?;
        let publish = message.to_publish(pkid);
        self.track(pkid, Packet::Publish(publish.clone()));
        Ok(publish)
    }

    pub fn subscribe(&mut self, filters: Vec<SubscribeFilter>) -> Result<Subscribe, MqttError> {
        let pkid = self.next_pkid()?;
        let subscribe = Subscribe { pkid, filters };
        self.track(pkid, Packet::Subscribe(subscribe.clone()));
        Ok(subscribe)
    }

    pub fn unsubscribe(&mut self, topics: Vec<String>) -> Result<Unsubscribe, MqttError> {
        let pkid = self.next_pkid()?;
        let unsubscribe = Unsubscribe { pkid, topics };
        self.track(pkid, Packet::Unsubscribe(unsubscribe.clone()));
        Ok(unsubscribe)
    }

    pub fn mark_sent(&mut self, pkid: u16) {
        if let Some(entry) = self.outgoing.get_mut(&pkid) {
            entry.sent = true;
        }
    }

    /// Drops an outgoing entry without completing its handshake.
    pub fn remove(&mut self, pkid: u16) -> bool {
        self.outgoing.remove(&pkid).is_some()
    }

    pub fn handle_puback(&mut self, pkid: u16) -> bool {
        match self.outgoing.get(&pkid) {
            Some(Entry {
                packet: Packet::Publish(_),
                ..
            }) => self.remove(pkid),
            _ => {
                debug!("PUBACK for unknown packet id {pkid}");
                false
            }
        }
    }

    /// First half of an outgoing QoS 2 handshake. The pending PUBLISH is
    /// replaced by the PUBREL that has to be sent next.
    pub fn handle_pubrec(&mut self, pkid: u16) -> Option<Packet> {
        match self.outgoing.get(&pkid).map(|entry| &entry.packet) {
            Some(Packet::Publish(publish)) if publish.qos == QoS::ExactlyOnce => {}
            Some(Packet::PubRel(_)) => {}
            _ => {
                debug!("PUBREC for unknown packet id {pkid}");
                return None;
            }
        }
        self.outgoing.insert(
            pkid,
            Entry {
                packet: Packet::PubRel(pkid),
                sent: true,
            },
        );
        Some(Packet::PubRel(pkid))
    }

    pub fn handle_pubcomp(&mut self, pkid: u16) -> bool {
        match self.outgoing.get(&pkid) {
            Some(Entry {
                packet: Packet::PubRel(_),
                ..
            }) => self.remove(pkid),
            _ => {
                debug!("PUBCOMP for unknown packet id {pkid}");
                false
            }
        }
    }

    /// Receiver side of PUBLISH. Returns the acknowledgement to send and the
    /// message to hand to the application. A QoS 2 redelivery of an
    /// identifier we already answered is acknowledged again but not
    /// delivered twice.
    pub fn handle_incoming_publish(&mut self, publish: Publish) -> (Option<Packet>, Option<Message>) {
        match publish.qos {
            QoS::AtMostOnce => (None, Some(Message::from(publish))),
            QoS::AtLeastOnce => {
                let ack = Packet::PubAck(publish.pkid);
                (Some(ack), Some(Message::from(publish)))
            }
            QoS::ExactlyOnce => {
                let pkid = publish.pkid;
                let first = self.incoming.insert(pkid);
                if !first {
                    debug!("Suppressing duplicate QoS 2 delivery of packet id {pkid}");
                }
                let message = first.then(|| Message::from(publish));
                (Some(Packet::PubRec(pkid)), message)
            }
        }
    }

    /// Second half of an incoming QoS 2 handshake. PUBCOMP is owed even for
    /// an identifier we no longer track.
    pub fn handle_pubrel(&mut self, pkid: u16) -> Packet {
        if !self.incoming.remove(&pkid) {
            debug!("PUBREL for unknown packet id {pkid}");
        }
        Packet::PubComp(pkid)
    }

    /// Completes a SUBSCRIBE, returning its topic filters.
    pub fn handle_suback(&mut self, pkid: u16) -> Option<Vec<String>> {
        match self.outgoing.get(&pkid).map(|entry| &entry.packet) {
            Some(Packet::Subscribe(subscribe)) => {
                let topics = subscribe.filters.iter().map(|f| f.path.clone()).collect();
                self.outgoing.remove(&pkid);
                Some(topics)
            }
            _ => {
                debug!("SUBACK for unknown packet id {pkid}");
                None
            }
        }
    }

    /// Completes an UNSUBSCRIBE, returning its topic filters.
    pub fn handle_unsuback(&mut self, pkid: u16) -> Option<Vec<String>> {
        match self.outgoing.remove(&pkid) {
            Some(Entry {
                packet: Packet::Unsubscribe(unsubscribe),
                ..
            }) => Some(unsubscribe.topics),
            Some(other) => {
                self.outgoing.insert(pkid, other);
                debug!("UNSUBACK for packet id {pkid} which is not an UNSUBSCRIBE");
                None
            }
            None => {
                debug!("UNSUBACK for unknown packet id {pkid}");
                None
            }
        }
    }

    /// Everything still pending, ready to be sent again. PUBLISH packets that
    /// already went out carry DUP; the rest are resent unchanged. Incoming
    /// QoS 2 messages get their PUBREC again.
    pub fn retransmissions(&mut self) -> Vec<Packet> {
        let mut packets = Vec::with_capacity(self.outgoing.len() + self.incoming.len());
        for entry in self.outgoing.values_mut() {
            if entry.sent {
                if let Packet::Publish(publish) = &mut entry.packet {
                    publish.dup = true;
                }
            }
            entry.sent = true;
            packets.push(entry.packet.clone());
        }
        packets.extend(self.incoming.iter().map(|pkid| Packet::PubRec(*pkid)));
        packets
    }

    pub fn contains(&self, pkid: u16) -> bool {
        self.outgoing.contains_key(&pkid)
    }

    pub fn awaiting_pubrel(&self, pkid: u16) -> bool {
        self.incoming.contains(&pkid)
    }

    pub fn len(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.is_empty()
    }
}
