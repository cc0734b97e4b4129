//! Runs a session against a tiny in-process broker that acknowledges
//! everything and echoes publishes back to the client.

use bytes::BytesMut;
use mqttkit::protocol::{
    ConnAck, ConnectReturnCode, Decoder, Packet, QoS, SubAck, SubscribeReturnCode,
};
use mqttkit::transport::mock::MockConnector;
use mqttkit::{Event, Options, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

async fn serve(mut stream: DuplexStream) {
    let mut decoder = Decoder::new();
    let mut buf = BytesMut::new();

    loop {
        while let Some(packet) = decoder.decode(&mut buf).unwrap() {
            let replies = match packet {
                Packet::Connect(_) => vec![Packet::ConnAck(ConnAck::new(
                    ConnectReturnCode::Accepted,
                    false,
                ))],
                Packet::Subscribe(subscribe) => vec![Packet::SubAck(SubAck {
                    pkid: subscribe.pkid,
                    return_codes: subscribe
                        .filters
                        .iter()
                        .map(|f| SubscribeReturnCode::Success(f.qos.min(QoS::AtLeastOnce)))
                        .collect(),
                })],
                Packet::Publish(publish) => {
                    let mut echo = publish.clone();
                    echo.dup = false;
                    match publish.qos {
                        QoS::AtMostOnce => vec![Packet::Publish(echo)],
                        QoS::AtLeastOnce => {
                            vec![Packet::PubAck(publish.pkid), Packet::Publish(echo)]
                        }
                        QoS::ExactlyOnce => vec![Packet::PubRec(publish.pkid)],
                    }
                }
                Packet::PubRel(pkid) => vec![Packet::PubComp(pkid)],
                Packet::PingReq => vec![Packet::PingResp],
                Packet::Disconnect => return,
                _ => Vec::new(),
            };

            for reply in replies {
                let mut out = BytesMut::new();
                reply.encode(&mut out).unwrap();
                stream.write_all(&out).await.unwrap();
            }
        }

        if stream.read_buf(&mut buf).await.unwrap() == 0 {
            return;
        }
    }
}

#[tokio::main]
async fn main() {
    mqttkit_utils::logging::init("debug");

    let (connector, mut broker) = MockConnector::new();
    tokio::spawn(async move {
        while let Some(stream) = broker.accept().await {
            tokio::spawn(serve(stream));
        }
    });

    let options = Options::new("mock").with_client_id("demo").with_keep_alive(5);
    let (session, mut events) = Session::new(options, connector);
    session.connect().await.expect("Failed to connect");

    while let Some(event) = events.recv().await {
        println!("{event:?}");
        match event {
            Event::Connected => {
                session.subscribe(["demo/#"]).unwrap();
            }
            Event::Subscribed { .. } => {
                session
                    .publish_to("demo/hello", "Hello from mqttkit", QoS::AtLeastOnce, false)
                    .unwrap();
            }
            Event::Message(message) => {
                println!("Echoed: {} = {:?}", message.topic, message.payload_str());
                break;
            }
            _ => {}
        }
    }

    session.disconnect().await;
}
