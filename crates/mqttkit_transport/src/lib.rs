//! mqttkit_transport
//!
//! The byte stream a session talks MQTT over. A `Connector` opens a fresh
//! `Stream` per connection attempt; the session splits it into a reader and
//! a writer and never looks underneath.
//!
//! Public types:
//! - `Connector`: opens streams to a host and port, optionally over TLS.
//! - `TcpConnector`: tokio TCP with rustls for TLS.
//! - `mock::MockConnector`: in-memory streams for tests and simulations.

pub mod error;
pub mod mock;
pub mod tcp;

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

pub use error::TransportError;
pub use tcp::TcpConnector;

/// Read half of an open stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an open stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open, bidirectional byte stream split into its two halves.
pub struct Stream {
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

impl Stream {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer)
    }

    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

/// Opens byte streams to a broker.
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        host: &str,
        port: u16,
        tls: bool,
    ) -> impl Future<Output = Result<Stream, TransportError>> + Send;
}

#[cfg(test)]
mod tests;
