use serde::Deserialize;

/// Top-level configuration for an MQTT client.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub session: SessionSettings,
    pub will: Option<WillSettings>,
    pub log: LogSettings,
}

/// Where to connect.
///
/// `port` left unset means the protocol default, resolved by the session
/// options: 1883, or 8883 with TLS.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: Option<u16>,
    pub tls: bool,
}

/// Session behaviour: identity, credentials, keepalive and reconnect.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Generated at session creation when unset.
    pub client_id: Option<String>,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auto_reconnect: bool,
    pub auto_reconnect_timeout_secs: u64,
    pub buffer_size: usize,
}

/// Last-will message registered with the broker on connect.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct WillSettings {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration as read from files or the environment.
///
/// Every field is optional; missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub session: Option<PartialSessionSettings>,
    pub will: Option<WillSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSessionSettings {
    pub client_id: Option<String>,
    pub clean_session: Option<bool>,
    pub keep_alive_secs: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auto_reconnect: Option<bool>,
    pub auto_reconnect_timeout_secs: Option<u64>,
    pub buffer_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                host: "localhost".to_string(),
                port: None,
                tls: false,
            },
            session: SessionSettings {
                client_id: None,
                clean_session: true,
                keep_alive_secs: 10,
                username: None,
                password: None,
                auto_reconnect: true,
                auto_reconnect_timeout_secs: 60,
                buffer_size: 4096,
            },
            will: None,
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let broker = self.broker.unwrap_or_default();
        let session = self.session.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            broker: BrokerSettings {
                host: broker.host.unwrap_or(default.broker.host),
                port: broker.port.or(default.broker.port),
                tls: broker.tls.unwrap_or(default.broker.tls),
            },
            session: SessionSettings {
                client_id: session.client_id.or(default.session.client_id),
                clean_session: session
                    .clean_session
                    .unwrap_or(default.session.clean_session),
                keep_alive_secs: session
                    .keep_alive_secs
                    .unwrap_or(default.session.keep_alive_secs),
                username: session.username.or(default.session.username),
                password: session.password.or(default.session.password),
                auto_reconnect: session
                    .auto_reconnect
                    .unwrap_or(default.session.auto_reconnect),
                auto_reconnect_timeout_secs: session
                    .auto_reconnect_timeout_secs
                    .unwrap_or(default.session.auto_reconnect_timeout_secs),
                buffer_size: session.buffer_size.unwrap_or(default.session.buffer_size),
            },
            will: self.will.or(default.will),
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}
