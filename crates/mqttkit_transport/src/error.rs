use thiserror::Error;

/// Failures opening or using the byte stream underneath a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection attempt timed out")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid DNS name for TLS: {0}")]
    InvalidDnsName(String),

    #[error("connection refused")]
    Refused,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::Refused,
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Io(err.to_string()),
        }
    }
}
