//! # mqttkit
//!
//! `mqttkit` is an MQTT 3.1.1 client built on tokio. It speaks the binary
//! control-packet protocol to a broker over TCP or TLS, keeps QoS 1 and 2
//! deliveries pending until their handshake completes, probes the broker
//! with keepalive pings and reconnects on its own after transient loss.
//!
//! ## Core Modules
//!
//! - `protocol`: packet model, binary codec and topic filter matching.
//! - `session`: the client session, its delivery engine and timers.
//! - `transport`: the byte streams a session runs over.
//! - `config`: layered configuration from files and the environment.
//!
//! ```no_run
//! use mqttkit::{Event, Options, QoS, Session, TcpConnector};
//!
//! # async fn run() -> Result<(), mqttkit::MqttError> {
//! let options = Options::new("broker.local").with_keep_alive(30);
//! let (session, mut events) = Session::new(options, TcpConnector::new());
//! session.connect().await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::Connected => {
//!             session.subscribe(["sensors/+/temp"])?;
//!         }
//!         Event::Message(message) => println!("{}: {:?}", message.topic, message.payload),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub use mqttkit_config as config;
pub use mqttkit_protocol as protocol;
pub use mqttkit_session as session;
pub use mqttkit_transport as transport;

pub use mqttkit_protocol::{ConnAck, ConnectReturnCode, Message, QoS, SubscribeReturnCode, matches};
pub use mqttkit_session::{ConnectionState, Event, MqttError, Options, Session};
pub use mqttkit_transport::{Connector, TcpConnector};
