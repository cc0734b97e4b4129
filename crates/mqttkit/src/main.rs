//! CLI for mqttkit
//!
//! Subcommands:
//! - `pub`: publish one message and wait for its handshake to finish
//! - `sub`: print messages on one or more topic filters until Ctrl-C

use std::borrow::Cow;
use std::time::Duration;

use chrono::{Local, Utc};
use clap::{Args, Parser};
use mqttkit::{Event, Message, MqttError, Options, QoS, Session, TcpConnector};
use mqttkit_config::{Settings, load_config};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

const DELIVERY_POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "mqttkit", about = "MQTT 3.1.1 command-line client")]
enum Command {
    /// Publish a single message
    Pub {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Topic to publish to
        #[arg(short, long)]
        topic: String,
        /// Message payload
        #[arg(short, long)]
        message: String,
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        /// Ask the broker to retain the message
        #[arg(short, long)]
        retain: bool,
    },
    /// Subscribe and print incoming messages
    Sub {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Topic filters, `+` and `#` wildcards allowed
        #[arg(short, long = "topic", required = true, num_args = 1..)]
        topics: Vec<String>,
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        /// Print one JSON object per message
        #[arg(long)]
        json: bool,
    },
}

/// Overrides for the loaded configuration.
#[derive(Args)]
struct ConnectionArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    tls: bool,
    #[arg(long)]
    client_id: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Keepalive interval in seconds, 0 to disable
    #[arg(long)]
    keep_alive: Option<u16>,
    #[arg(long)]
    log_level: Option<String>,
}

impl ConnectionArgs {
    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.broker.host = host;
        }
        if self.port.is_some() {
            settings.broker.port = self.port;
        }
        if self.tls {
            settings.broker.tls = true;
        }
        if self.client_id.is_some() {
            settings.session.client_id = self.client_id;
        }
        if self.username.is_some() {
            settings.session.username = self.username;
        }
        if self.password.is_some() {
            settings.session.password = self.password;
        }
        if let Some(keep_alive) = self.keep_alive {
            settings.session.keep_alive_secs = keep_alive;
        }
        if let Some(level) = self.log_level {
            settings.log.level = level;
        }
    }
}

#[derive(Serialize)]
struct Received<'a> {
    timestamp: String,
    topic: &'a str,
    qos: u8,
    retain: bool,
    payload: Cow<'a, str>,
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    let result = match cmd {
        Command::Pub {
            conn,
            topic,
            message,
            qos,
            retain,
        } => match session_options(conn) {
            Ok(options) => run_pub(options, topic, message, qos, retain).await,
            Err(e) => Err(e),
        },
        Command::Sub {
            conn,
            topics,
            qos,
            json,
        } => match session_options(conn) {
            Ok(options) => run_sub(options, topics, qos, json).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        error!("mqttkit failed: {}", e);
        std::process::exit(1);
    }
}

/// Loads configuration, applies command-line overrides and starts logging.
fn session_options(conn: ConnectionArgs) -> Result<Options, Box<dyn std::error::Error>> {
    let mut settings = load_config()?;
    conn.apply(&mut settings);
    mqttkit_utils::logging::init(&settings.log.level);
    Ok(Options::from_settings(&settings)?)
}

/// Waits for the broker to accept the connection.
async fn wait_connected(events: &mut UnboundedReceiver<Event>) -> Result<(), MqttError> {
    while let Some(event) = events.recv().await {
        match event {
            Event::Connected => return Ok(()),
            Event::Disconnected(Some(cause)) => return Err(cause),
            Event::Disconnected(None) => return Err(MqttError::ConnectionClosed),
            _ => {}
        }
    }
    Err(MqttError::ConnectionClosed)
}

async fn run_pub(
    options: Options,
    topic: String,
    message: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let (session, mut events) = Session::new(options, TcpConnector::new());
    session.connect().await?;
    wait_connected(&mut events).await?;

    let message = Message::new(topic, message, qos).with_retain(retain);
    match session.publish(message)? {
        Some(pkid) => info!("Published packet {pkid}, waiting for the broker"),
        None => info!("Published"),
    }

    tokio::select! {
        _ = async {
            while session.pending() > 0 {
                tokio::time::sleep(DELIVERY_POLL).await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted before the broker acknowledged the message");
        }
    }

    session.disconnect().await;
    Ok(())
}

async fn run_sub(
    options: Options,
    topics: Vec<String>,
    qos: u8,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let (session, mut events) = Session::new(options, TcpConnector::new());
    session.connect().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                // A clean session loses its subscriptions on every reconnect.
                Some(Event::Connected) => {
                    session.subscribe_with_qos(topics.iter().map(|topic| (topic.as_str(), qos)))?;
                }
                Some(Event::Subscribed { topics: filters, granted }) => {
                    info!("Subscribed to {filters:?}, granted {granted:?}");
                }
                Some(Event::Message(message)) => print_message(&message, json)?,
                Some(Event::Disconnected(Some(MqttError::ConnectionRefused(code)))) => {
                    return Err(MqttError::ConnectionRefused(code).into());
                }
                Some(Event::Disconnected(cause)) => {
                    warn!("Disconnected: {cause:?}");
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
        }
    }

    session.disconnect().await;
    Ok(())
}

fn print_message(message: &Message, json: bool) -> Result<(), serde_json::Error> {
    let payload = match message.payload_str() {
        Some(text) => Cow::Borrowed(text),
        None => Cow::Owned(format!("<{} bytes>", message.payload.len())),
    };

    if json {
        let received = Received {
            timestamp: Utc::now().to_rfc3339(),
            topic: &message.topic,
            qos: message.qos as u8,
            retain: message.retain,
            payload,
        };
        println!("{}", serde_json::to_string(&received)?);
    } else {
        println!(
            "{} {} {}",
            Local::now().format("%H:%M:%S%.3f"),
            message.topic,
            payload
        );
    }
    Ok(())
}
