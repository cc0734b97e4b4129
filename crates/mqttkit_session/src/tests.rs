use std::time::Duration;

use bytes::BytesMut;
use mqttkit_protocol::{
    ConnAck, ConnectReturnCode, Decoder, Message, Packet, ProtocolError, Publish, QoS, SubAck,
    SubscribeFilter, SubscribeReturnCode,
};
use mqttkit_transport::TransportError;
use mqttkit_transport::mock::{MockBroker, MockConnector};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use super::*;

const WAIT: Duration = Duration::from_secs(5);

/// Broker end of one mock connection.
struct BrokerLink {
    stream: DuplexStream,
    buf: BytesMut,
    decoder: Decoder,
}

impl BrokerLink {
    /// Next packet from the client, `None` once it closed the stream.
    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.decoder.decode(&mut self.buf).unwrap() {
                return Some(packet);
            }
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return None;
            }
        }
    }

    async fn expect(&mut self) -> Packet {
        timeout(WAIT, self.recv())
            .await
            .expect("timed out waiting for a packet")
            .expect("client closed the stream")
    }

    async fn send(&mut self, packet: Packet) {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }
}

fn options() -> Options {
    Options::new("broker.test")
        .with_client_id("test-client")
        .with_keep_alive(0)
        .with_auto_reconnect(false)
}

async fn accept(broker: &mut MockBroker) -> BrokerLink {
    let stream = timeout(WAIT, broker.accept())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped");
    BrokerLink {
        stream,
        buf: BytesMut::new(),
        decoder: Decoder::new(),
    }
}

/// Reads CONNECT and accepts it.
async fn handshake(link: &mut BrokerLink) {
    assert!(matches!(link.expect().await, Packet::Connect(_)));
    link.send(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted, false)))
        .await;
}

async fn next_event(events: &mut UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skips events until one matches.
async fn wait_for(events: &mut UnboundedReceiver<Event>, pred: impl Fn(&Event) -> bool) -> Event {
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn eventually(f: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn connected_session(
    options: Options,
) -> (
    Session<MockConnector>,
    UnboundedReceiver<Event>,
    MockBroker,
    BrokerLink,
) {
    let (connector, mut broker) = MockConnector::new();
    let (session, mut events) = Session::new(options, connector);
    session.connect().await.unwrap();
    let mut link = accept(&mut broker).await;
    handshake(&mut link).await;
    wait_for(&mut events, |e| *e == Event::Connected).await;
    (session, events, broker, link)
}

#[tokio::test]
async fn test_connect_handshake_emits_events_in_order() {
    let (connector, mut broker) = MockConnector::new();
    let (session, mut events) = Session::new(options(), connector);

    session.connect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connecting);

    let mut link = accept(&mut broker).await;
    match link.expect().await {
        Packet::Connect(connect) => {
            assert_eq!(connect.client_id, "test-client");
            assert!(connect.clean_session);
            assert_eq!(connect.keep_alive, 0);
        }
        other => panic!("expected CONNECT, got {other:?}"),
    }
    assert_eq!(
        next_event(&mut events).await,
        Event::StateChanged(ConnectionState::Connecting)
    );

    let connack = ConnAck::new(ConnectReturnCode::Accepted, false);
    link.send(Packet::ConnAck(connack)).await;
    assert_eq!(next_event(&mut events).await, Event::ConnAck(connack));
    assert_eq!(
        next_event(&mut events).await,
        Event::StateChanged(ConnectionState::Connected)
    );
    assert_eq!(next_event(&mut events).await, Event::Connected);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let (connector, _broker) = MockConnector::new();
    let (session, _events) = Session::new(options(), connector);

    session.connect().await.unwrap();
    assert_eq!(
        session.connect().await,
        Err(MqttError::AlreadyConnected)
    );
}

#[tokio::test]
async fn test_transport_failure_is_reported() {
    let (connector, broker) = MockConnector::new();
    broker.refuse_connections(true);
    let (session, mut events) = Session::new(options(), connector);

    assert_eq!(
        session.connect().await,
        Err(MqttError::Transport(TransportError::Refused))
    );
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_rejected_connack_disconnects_without_retry() {
    let (connector, mut broker) = MockConnector::new();
    let (session, mut events) = Session::new(options().with_auto_reconnect(true), connector);

    session.connect().await.unwrap();
    let mut link = accept(&mut broker).await;
    assert!(matches!(link.expect().await, Packet::Connect(_)));
    link.send(Packet::ConnAck(ConnAck::new(
        ConnectReturnCode::NotAuthorized,
        false,
    )))
    .await;

    let event = wait_for(&mut events, |e| matches!(e, Event::Disconnected(_))).await;
    assert_eq!(
        event,
        Event::Disconnected(Some(MqttError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized
        )))
    );
    assert_eq!(session.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(broker.attempts(), 1);
}

#[tokio::test]
async fn test_qos1_publish_completes_on_puback() {
    let (session, _events, _broker, mut link) = connected_session(options()).await;

    let pkid = session
        .publish_to("a/b", "hello", QoS::AtLeastOnce, false)
        .unwrap()
        .unwrap();
    match link.expect().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.pkid, pkid);
            assert_eq!(publish.qos, QoS::AtLeastOnce);
            assert!(!publish.dup);
            assert_eq!(&publish.payload[..], b"hello");
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }
    assert_eq!(session.pending(), 1);

    link.send(Packet::PubAck(pkid)).await;
    eventually(|| session.pending() == 0).await;
}

#[tokio::test]
async fn test_qos2_publish_runs_full_handshake() {
    let (session, _events, _broker, mut link) = connected_session(options()).await;

    let pkid = session
        .publish_to("a/b", "once", QoS::ExactlyOnce, true)
        .unwrap()
        .unwrap();
    match link.expect().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.qos, QoS::ExactlyOnce);
            assert!(publish.retain);
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }

    link.send(Packet::PubRec(pkid)).await;
    assert_eq!(link.expect().await, Packet::PubRel(pkid));
    assert_eq!(session.pending(), 1);

    link.send(Packet::PubComp(pkid)).await;
    eventually(|| session.pending() == 0).await;
}

#[tokio::test]
async fn test_incoming_qos2_duplicate_is_delivered_once() {
    let (_session, mut events, _broker, mut link) = connected_session(options()).await;

    let mut publish = Publish::new("in/q2", QoS::ExactlyOnce, "payload");
    publish.pkid = 7;
    link.send(Packet::Publish(publish.clone())).await;
    assert_eq!(link.expect().await, Packet::PubRec(7));
    assert_eq!(
        next_event(&mut events).await,
        Event::Message(Message::from(publish.clone()))
    );

    publish.dup = true;
    link.send(Packet::Publish(publish)).await;
    assert_eq!(link.expect().await, Packet::PubRec(7));

    link.send(Packet::PubRel(7)).await;
    assert_eq!(link.expect().await, Packet::PubComp(7));

    // A QoS 0 marker must be the very next message.
    link.send(Packet::Publish(Publish::new("marker", QoS::AtMostOnce, "")))
        .await;
    match next_event(&mut events).await {
        Event::Message(message) => assert_eq!(message.topic, "marker"),
        other => panic!("expected the marker, got {other:?}"),
    }
}

#[tokio::test]
async fn test_incoming_qos1_is_acknowledged() {
    let (_session, mut events, _broker, mut link) = connected_session(options()).await;

    let mut publish = Publish::new("in/q1", QoS::AtLeastOnce, "21.5");
    publish.pkid = 12;
    link.send(Packet::Publish(publish.clone())).await;

    assert_eq!(link.expect().await, Packet::PubAck(12));
    let message = match next_event(&mut events).await {
        Event::Message(message) => message,
        other => panic!("expected a message, got {other:?}"),
    };
    assert_eq!(message.topic, "in/q1");
    assert_eq!(message.payload_str(), Some("21.5"));
}

#[tokio::test]
async fn test_subscribe_and_unsubscribe_report_topics() {
    let (session, mut events, _broker, mut link) = connected_session(options()).await;

    let pkid = session.subscribe(["sensors/+/temp"]).unwrap();
    match link.expect().await {
        Packet::Subscribe(subscribe) => {
            assert_eq!(subscribe.pkid, pkid);
            assert_eq!(
                subscribe.filters,
                vec![SubscribeFilter::new("sensors/+/temp", QoS::ExactlyOnce)]
            );
        }
        other => panic!("expected SUBSCRIBE, got {other:?}"),
    }
    link.send(Packet::SubAck(SubAck {
        pkid,
        return_codes: vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)],
    }))
    .await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Subscribed {
            topics: vec!["sensors/+/temp".to_string()],
            granted: vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)],
        }
    );

    let pkid = session.unsubscribe(["sensors/+/temp"]).unwrap();
    match link.expect().await {
        Packet::Unsubscribe(unsubscribe) => {
            assert_eq!(unsubscribe.topics, vec!["sensors/+/temp".to_string()]);
        }
        other => panic!("expected UNSUBSCRIBE, got {other:?}"),
    }
    link.send(Packet::UnsubAck(pkid)).await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Unsubscribed {
            topics: vec!["sensors/+/temp".to_string()],
        }
    );
    assert_eq!(session.pending(), 0);
}

#[tokio::test]
async fn test_invalid_arguments_are_rejected() {
    let (connector, _broker) = MockConnector::new();
    let (session, _events) = Session::new(options(), connector);

    assert_eq!(
        session.subscribe(Vec::<String>::new()),
        Err(MqttError::EmptyTopicList)
    );
    assert_eq!(
        session.unsubscribe(Vec::<String>::new()),
        Err(MqttError::EmptyTopicList)
    );
    assert_eq!(
        session.subscribe(["a/#/b"]),
        Err(MqttError::InvalidTopicFilter("a/#/b".to_string()))
    );
    assert_eq!(
        session.publish_to("a/+", "x", QoS::AtLeastOnce, false),
        Err(MqttError::InvalidTopicName("a/+".to_string()))
    );
    assert_eq!(session.pending(), 0);
}

#[tokio::test]
async fn test_qos0_needs_a_connection() {
    let (connector, _broker) = MockConnector::new();
    let (session, _events) = Session::new(options(), connector);

    assert_eq!(
        session.publish_to("t", "p", QoS::AtMostOnce, false),
        Err(MqttError::NotConnected)
    );
}

#[tokio::test]
async fn test_publish_before_connect_is_sent_after_connack() {
    let (connector, mut broker) = MockConnector::new();
    let (session, _events) = Session::new(options(), connector);

    let pkid = session
        .publish_to("queued", "early", QoS::AtLeastOnce, false)
        .unwrap()
        .unwrap();
    assert_eq!(session.pending(), 1);

    session.connect().await.unwrap();
    let mut link = accept(&mut broker).await;
    handshake(&mut link).await;

    match link.expect().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.pkid, pkid);
            assert!(!publish.dup);
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }
}

#[tokio::test]
async fn test_user_disconnect_sends_disconnect_and_stays_down() {
    let (session, mut events, broker, mut link) =
        connected_session(options().with_auto_reconnect(true)).await;

    session.disconnect().await;
    assert_eq!(link.expect().await, Packet::Disconnect);
    assert_eq!(timeout(WAIT, link.recv()).await.unwrap(), None);

    assert_eq!(
        next_event(&mut events).await,
        Event::StateChanged(ConnectionState::Disconnected)
    );
    assert_eq!(next_event(&mut events).await, Event::Disconnected(None));
    assert_eq!(session.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(broker.attempts(), 1);
}

#[tokio::test]
async fn test_broker_disconnect_triggers_reconnect() {
    let (session, mut events, mut broker, mut link) =
        connected_session(options().with_auto_reconnect(true)).await;

    link.send(Packet::Disconnect).await;
    let event = wait_for(&mut events, |e| matches!(e, Event::Disconnected(_))).await;
    assert_eq!(event, Event::Disconnected(Some(MqttError::ConnectionClosed)));

    let mut link = accept(&mut broker).await;
    handshake(&mut link).await;
    wait_for(&mut events, |e| *e == Event::Connected).await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(broker.attempts(), 2);
}

#[tokio::test]
async fn test_reconnect_retransmits_pending_publish_with_dup() {
    let (session, mut events, mut broker, mut link) =
        connected_session(options().with_auto_reconnect(true)).await;

    let pkid = session
        .publish_to("a/b", "again", QoS::AtLeastOnce, false)
        .unwrap()
        .unwrap();
    assert!(matches!(link.expect().await, Packet::Publish(_)));

    drop(link);
    wait_for(&mut events, |e| matches!(e, Event::Disconnected(_))).await;

    let mut link = accept(&mut broker).await;
    handshake(&mut link).await;
    match link.expect().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.pkid, pkid);
            assert!(publish.dup);
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }
    assert_eq!(session.pending(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_pings_then_times_out() {
    let (session, mut events, _broker, mut link) =
        connected_session(options().with_keep_alive(1)).await;

    assert_eq!(link.expect().await, Packet::PingReq);

    let event = wait_for(&mut events, |e| matches!(e, Event::Disconnected(_))).await;
    assert_eq!(event, Event::Disconnected(Some(MqttError::KeepAliveTimeout)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(timeout(WAIT, link.recv()).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_pingresp_keeps_the_link_alive() {
    let (session, _events, _broker, mut link) =
        connected_session(options().with_keep_alive(1)).await;

    for _ in 0..5 {
        assert_eq!(link.expect().await, Packet::PingReq);
        link.send(Packet::PingResp).await;
    }
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_window() {
    let (_session, mut events, broker, link) = connected_session(
        options()
            .with_auto_reconnect(true)
            .with_auto_reconnect_timeout(Duration::from_secs(3)),
    )
    .await;

    broker.refuse_connections(true);
    drop(link);
    wait_for(&mut events, |e| matches!(e, Event::Disconnected(_))).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    let attempts = broker.attempts();
    assert!(attempts > 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.attempts(), attempts);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_reconnecting() {
    let (session, mut events, broker, link) =
        connected_session(options().with_auto_reconnect(true)).await;

    broker.refuse_connections(true);
    drop(link);
    wait_for(&mut events, |e| matches!(e, Event::Disconnected(_))).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(broker.attempts() > 1);

    session.disconnect().await;
    let attempts = broker.attempts();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.attempts(), attempts);
}

#[tokio::test]
async fn test_malformed_packet_is_skipped() {
    let (session, mut events, _broker, mut link) = connected_session(options()).await;

    // PUBLISH with QoS 3.
    link.stream.write_all(&[0x36, 0x02, 0x00, 0x00]).await.unwrap();
    link.send(Packet::Publish(Publish::new("after", QoS::AtMostOnce, "ok")))
        .await;

    match next_event(&mut events).await {
        Event::Message(message) => assert_eq!(message.topic, "after"),
        other => panic!("expected a message, got {other:?}"),
    }
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_broken_framing_drops_the_connection() {
    let (session, mut events, _broker, mut link) = connected_session(options()).await;

    link.stream
        .write_all(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01])
        .await
        .unwrap();

    let event = wait_for(&mut events, |e| matches!(e, Event::Disconnected(_))).await;
    assert_eq!(
        event,
        Event::Disconnected(Some(MqttError::Protocol(
            ProtocolError::MalformedRemainingLength
        )))
    );
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_packet_ids_survive_reconnect() {
    let (session, mut events, mut broker, mut link) =
        connected_session(options().with_auto_reconnect(true)).await;

    let first = session
        .publish_to("a", "1", QoS::AtLeastOnce, false)
        .unwrap()
        .unwrap();
    assert!(matches!(link.expect().await, Packet::Publish(_)));
    link.send(Packet::PubAck(first)).await;
    eventually(|| session.pending() == 0).await;

    link.send(Packet::Disconnect).await;
    wait_for(&mut events, |e| matches!(e, Event::Disconnected(_))).await;
    let mut link = accept(&mut broker).await;
    handshake(&mut link).await;
    wait_for(&mut events, |e| *e == Event::Connected).await;

    let second = session
        .publish_to("a", "2", QoS::AtLeastOnce, false)
        .unwrap()
        .unwrap();
    assert_eq!(second, first + 1);
}
