//! Session configuration.

use std::time::Duration;

use bytes::Bytes;
use mqttkit_config::Settings;
use mqttkit_protocol::{Connect, LastWill, Message, QoS};
use uuid::Uuid;

use crate::error::MqttError;

/// Everything a `Session` needs to know about the broker and how to talk
/// to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub host: String,
    /// `None` means 1883, or 8883 with TLS.
    pub port: Option<u16>,
    pub tls: bool,
    pub client_id: String,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keepalive interval in seconds. 0 turns keepalive probing off.
    pub keep_alive: u16,
    pub will: Option<Message>,
    pub auto_reconnect: bool,
    /// How long after the last broker activity reconnect attempts continue.
    pub auto_reconnect_timeout: Duration,
    /// Read buffer growth step.
    pub buffer_size: usize,
}

/// Random client identifier, short enough for any 3.1.1 broker (at most 23
/// bytes).
pub fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("mqttkit-{}", &id[..12])
}

impl Options {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            tls: false,
            client_id: generate_client_id(),
            clean_session: true,
            username: None,
            password: None,
            keep_alive: 10,
            will: None,
            auto_reconnect: true,
            auto_reconnect_timeout: Duration::from_secs(60),
            buffer_size: 4096,
        }
    }

    /// Builds options from loaded configuration.
    pub fn from_settings(settings: &Settings) -> Result<Self, MqttError> {
        let session = &settings.session;
        let mut options = Options::new(settings.broker.host.clone())
            .with_tls(settings.broker.tls)
            .with_clean_session(session.clean_session)
            .with_keep_alive(session.keep_alive_secs)
            .with_auto_reconnect(session.auto_reconnect)
            .with_auto_reconnect_timeout(Duration::from_secs(session.auto_reconnect_timeout_secs))
            .with_buffer_size(session.buffer_size);

        options.port = settings.broker.port;
        if let Some(client_id) = &session.client_id {
            options.client_id = client_id.clone();
        }
        if let Some(username) = &session.username {
            options = options.with_credentials(username.clone(), session.password.clone());
        }
        if let Some(will) = &settings.will {
            let qos = QoS::try_from(will.qos)?;
            options = options.with_will(
                Message::new(will.topic.clone(), will.payload.clone(), qos).with_retain(will.retain),
            );
        }
        Ok(options)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive = secs;
        self
    }

    pub fn with_will(mut self, will: Message) -> Self {
        self.will = Some(will);
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_auto_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.auto_reconnect_timeout = timeout;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 8883 } else { 1883 })
    }

    pub(crate) fn connect_packet(&self) -> Connect {
        let mut connect = Connect::new(self.client_id.clone());
        connect.clean_session = self.clean_session;
        connect.keep_alive = self.keep_alive;
        connect.last_will = self.will.clone().map(LastWill::from);
        connect.username = self.username.clone();
        connect.password = self
            .password
            .as_ref()
            .map(|password| Bytes::from(password.clone().into_bytes()));
        connect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_conventions() {
        let options = Options::new("broker.local");
        assert_eq!(options.port(), 1883);
        assert_eq!(options.clone().with_tls(true).port(), 8883);
        assert_eq!(options.clone().with_tls(true).with_port(9000).port(), 9000);
        assert!(options.clean_session);
        assert!(options.auto_reconnect);
        assert_eq!(options.keep_alive, 10);
        assert_eq!(options.auto_reconnect_timeout, Duration::from_secs(60));
        assert_eq!(options.buffer_size, 4096);
    }

    #[test]
    fn generated_client_ids_are_short_and_unique() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert!(a.len() <= 23);
        assert!(a.starts_with("mqttkit-"));
        assert_ne!(a, b);
    }

    #[test]
    fn connect_packet_carries_options() {
        let options = Options::new("broker.local")
            .with_client_id("sensor-1")
            .with_clean_session(false)
            .with_keep_alive(30)
            .with_credentials("user", Some("pass".to_string()))
            .with_will(Message::new("sensors/1/status", "offline", QoS::AtLeastOnce).with_retain(true));

        let connect = options.connect_packet();
        assert_eq!(connect.client_id, "sensor-1");
        assert!(!connect.clean_session);
        assert_eq!(connect.keep_alive, 30);
        assert_eq!(connect.username.as_deref(), Some("user"));
        assert_eq!(connect.password.as_deref(), Some(&b"pass"[..]));

        let will = connect.last_will.expect("will set");
        assert_eq!(will.topic, "sensors/1/status");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn from_settings_applies_configuration() {
        let mut settings = Settings::default();
        settings.broker.host = "mqtt.example.com".to_string();
        settings.broker.tls = true;
        settings.session.client_id = Some("configured".to_string());
        settings.session.keep_alive_secs = 25;
        settings.session.username = Some("alice".to_string());
        settings.will = Some(mqttkit_config::WillSettings {
            topic: "clients/configured".to_string(),
            payload: "gone".to_string(),
            qos: 2,
            retain: false,
        });

        let options = Options::from_settings(&settings).unwrap();
        assert_eq!(options.host, "mqtt.example.com");
        assert_eq!(options.port(), 8883);
        assert_eq!(options.client_id, "configured");
        assert_eq!(options.keep_alive, 25);
        assert_eq!(options.username.as_deref(), Some("alice"));
        assert_eq!(options.password, None);
        assert_eq!(options.will.unwrap().qos, QoS::ExactlyOnce);
    }

    #[test]
    fn from_settings_rejects_bad_will_qos() {
        let mut settings = Settings::default();
        settings.will = Some(mqttkit_config::WillSettings {
            topic: "t".to_string(),
            payload: String::new(),
            qos: 3,
            retain: false,
        });
        assert!(matches!(
            Options::from_settings(&settings),
            Err(MqttError::Protocol(_))
        ));
    }
}
