//! In-memory transport
//!
//! `MockConnector` hands out one end of a `tokio::io::duplex` pipe per
//! connection attempt and passes the other end to a `MockBroker`, which plays
//! the server side. Dropping the broker's end looks like the network going
//! away; `refuse_connections` makes every attempt fail until switched back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{Connector, Stream, TransportError};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Clone)]
pub struct MockConnector {
    streams: mpsc::UnboundedSender<DuplexStream>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

/// Server side of a `MockConnector`.
pub struct MockBroker {
    streams: mpsc::UnboundedReceiver<DuplexStream>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> (MockConnector, MockBroker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let refuse = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            MockConnector {
                streams: tx,
                refuse: refuse.clone(),
                attempts: attempts.clone(),
            },
            MockBroker {
                streams: rx,
                refuse,
                attempts,
            },
        )
    }
}

impl Connector for MockConnector {
    async fn open(&self, host: &str, port: u16, _tls: bool) -> Result<Stream, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            trace!("Refusing mock connection to {host}:{port}");
            return Err(TransportError::Refused);
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.streams
            .send(server)
            .map_err(|_| TransportError::Refused)?;
        Ok(Stream::new(client))
    }
}

impl MockBroker {
    /// Waits for the next connection. `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.streams.recv().await
    }

    /// Returns a connection that is already waiting, without blocking.
    pub fn try_accept(&mut self) -> Option<DuplexStream> {
        self.streams.try_recv().ok()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}
