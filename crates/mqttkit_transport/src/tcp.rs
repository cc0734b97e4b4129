//! TCP transport with optional TLS.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use crate::{Connector, Stream, TransportError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    tls_config: Option<Arc<ClientConfig>>,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls_config: None,
        }
    }

    /// Bounds both the TCP connect and the TLS handshake.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Replaces the default client configuration (webpki roots, no client
    /// certificate) used for TLS connections.
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    fn client_config(&self) -> Arc<ClientConfig> {
        if let Some(config) = &self.tls_config {
            return config.clone();
        }

        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.to_vec());
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        )
    }
}

impl Connector for TcpConnector {
    async fn open(&self, host: &str, port: u16, tls: bool) -> Result<Stream, TransportError> {
        debug!("Opening TCP connection to {host}:{port} (tls: {tls})");
        let tcp_stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout)??;
        tcp_stream.set_nodelay(true)?;

        if !tls {
            let (reader, writer) = tcp_stream.into_split();
            return Ok(Stream::from_parts(reader, writer));
        }

        let domain = ServerName::try_from(host.to_string())
            .map_err(|_| TransportError::InvalidDnsName(host.to_string()))?;
        let connector = TlsConnector::from(self.client_config());
        let tls_stream = timeout(self.connect_timeout, connector.connect(domain, tcp_stream))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Stream::new(tls_stream))
    }
}
