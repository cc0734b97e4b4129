//! Session state machine
//!
//! `SessionState` holds the connection state, the pending-packet table and
//! the time of the last packet received from the broker. `handle_packet`
//! routes one decoded packet and reports what the caller has to do about it:
//! packets to write, events to emit and whether the link has to be closed.
//! It never touches the network, which keeps the whole dispatch table
//! testable with plain values.

use std::time::Duration;

use mqttkit_protocol::{ConnectReturnCode, Packet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::delivery::Delivery;
use crate::error::MqttError;
use crate::event::{ConnectionState, Event};

/// The link has to be torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub cause: Option<MqttError>,
    pub reconnect: bool,
}

/// What handling one inbound packet requires of the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub outgoing: Vec<Packet>,
    pub events: Vec<Event>,
    pub close: Option<Close>,
}

#[derive(Debug)]
pub struct SessionState {
    connection: ConnectionState,
    delivery: Delivery,
    last_activity: Instant,
}

impl SessionState {
    pub fn new(now: Instant) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            delivery: Delivery::new(),
            last_activity: now,
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn delivery_mut(&mut self) -> &mut Delivery {
        &mut self.delivery
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Time since the broker last sent anything.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Moves to `next` and returns the notifications for the change. Nothing
    /// is emitted when the state does not actually change.
    pub fn set_state(&mut self, next: ConnectionState, cause: Option<MqttError>) -> Vec<Event> {
        if self.connection == next {
            return Vec::new();
        }
        info!("Connection state {:?} -> {next:?}", self.connection);
        self.connection = next;

        let mut events = vec![Event::StateChanged(next)];
        match next {
            ConnectionState::Connected => events.push(Event::Connected),
            ConnectionState::Disconnected => events.push(Event::Disconnected(cause)),
            ConnectionState::Connecting => {}
        }
        events
    }

    pub fn handle_packet(&mut self, packet: Packet, now: Instant) -> Outcome {
        self.last_activity = now;
        let mut outcome = Outcome::default();

        match packet {
            Packet::ConnAck(connack) => {
                outcome.events.push(Event::ConnAck(connack));
                if self.connection != ConnectionState::Connecting {
                    warn!("Ignoring CONNACK while {:?}", self.connection);
                    return outcome;
                }
                if connack.code == ConnectReturnCode::Accepted {
                    debug!("CONNACK accepted (session present: {})", connack.session_present);
                    outcome
                        .events
                        .extend(self.set_state(ConnectionState::Connected, None));
                    outcome.outgoing = self.delivery.retransmissions();
                } else {
                    warn!("Broker refused connection: {:?}", connack.code);
                    outcome.close = Some(Close {
                        cause: Some(MqttError::ConnectionRefused(connack.code)),
                        reconnect: false,
                    });
                }
            }
            Packet::Publish(publish) => {
                let (reply, message) = self.delivery.handle_incoming_publish(publish);
                outcome.outgoing.extend(reply);
                outcome.events.extend(message.map(Event::Message));
            }
            Packet::PubAck(pkid) => {
                self.delivery.handle_puback(pkid);
            }
            Packet::PubRec(pkid) => {
                outcome.outgoing.extend(self.delivery.handle_pubrec(pkid));
            }
            Packet::PubRel(pkid) => {
                outcome.outgoing.push(self.delivery.handle_pubrel(pkid));
            }
            Packet::PubComp(pkid) => {
                self.delivery.handle_pubcomp(pkid);
            }
            Packet::SubAck(suback) => {
                if let Some(topics) = self.delivery.handle_suback(suback.pkid) {
                    outcome.events.push(Event::Subscribed {
                        topics,
                        granted: suback.return_codes,
                    });
                }
            }
            Packet::UnsubAck(pkid) => {
                if let Some(topics) = self.delivery.handle_unsuback(pkid) {
                    outcome.events.push(Event::Unsubscribed { topics });
                }
            }
            Packet::PingResp => {
                outcome.outgoing = self.delivery.retransmissions();
            }
            Packet::Disconnect => {
                info!("Broker sent DISCONNECT");
                outcome.close = Some(Close {
                    cause: Some(MqttError::ConnectionClosed),
                    reconnect: true,
                });
            }
            other @ (Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq) => {
                warn!("Ignoring unexpected {:?} from broker", other.packet_type());
            }
        }

        outcome
    }
}
