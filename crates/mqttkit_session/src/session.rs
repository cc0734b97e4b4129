//! Session handle and link tasks
//!
//! A `Session` is a cheap, cloneable handle to shared state behind one
//! mutex. Each connection ("link") gets two tasks: a reader that decodes
//! packets and dispatches them through `SessionState`, and a writer that
//! drains an ordered channel of encoded frames onto the stream, so writes
//! never interleave. Links are numbered; anything a task reports about a
//! link that has since been replaced is ignored.
//!
//! The mutex is never held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use futures::future::BoxFuture;
use mqttkit_protocol::{
    Decoder, Message, Packet, QoS, SubscribeFilter, valid_topic_filter, valid_topic_name,
};
use mqttkit_transport::{BoxReader, BoxWriter, Connector, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::MqttError;
use crate::event::{ConnectionState, Event};
use crate::keepalive::{self, KeepAlive, ReconnectStep};
use crate::options::Options;
use crate::state::{Close, SessionState};

const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

struct Link {
    epoch: u64,
    frames: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    /// Stops the reader. A graceful close lets the writer flush what is
    /// queued and shut the stream down, and hands back its handle.
    fn close(self, graceful: bool) -> Option<JoinHandle<()>> {
        self.reader.abort();
        if graceful {
            Some(self.writer)
        } else {
            self.writer.abort();
            None
        }
    }
}

struct Inner {
    state: SessionState,
    epoch: u64,
    link: Option<Link>,
    keepalive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    reconnecting: bool,
    user_disconnected: bool,
}

fn encode(packet: &Packet) -> Result<Bytes, MqttError> {
    let mut buf = BytesMut::new();
    packet.encode(&mut buf)?;
    Ok(buf.freeze())
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        self.link.as_ref().is_some_and(|link| link.epoch == epoch)
    }

    /// Queues an encoded frame. Tracked frames (those with a pending entry)
    /// only go out once the broker has accepted the connection; until then
    /// they wait for the retransmission sweep that follows CONNACK.
    fn queue(&mut self, frame: Bytes, tracked: Option<u16>) -> Result<(), MqttError> {
        let ready = tracked.is_none() || self.state.connection() == ConnectionState::Connected;
        let sent = ready
            && self
                .link
                .as_ref()
                .is_some_and(|link| link.frames.send(frame).is_ok());

        match tracked {
            Some(pkid) => {
                if sent {
                    self.state.delivery_mut().mark_sent(pkid);
                }
                Ok(())
            }
            None if sent => Ok(()),
            None => Err(MqttError::NotConnected),
        }
    }

    fn send(&mut self, packet: &Packet) -> Result<(), MqttError> {
        let frame = encode(packet)?;
        self.queue(frame, None)
    }

    /// Sends a packet whose pending entry was just created, dropping the
    /// entry again if the packet cannot be encoded.
    fn send_tracked(&mut self, packet: &Packet, pkid: u16) -> Result<(), MqttError> {
        match encode(packet) {
            Ok(frame) => self.queue(frame, Some(pkid)),
            Err(err) => {
                self.state.delivery_mut().remove(pkid);
                Err(err)
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.close(false);
        }
        for handle in [self.keepalive.take(), self.reconnect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

pub(crate) struct Shared<C> {
    options: Options,
    policy: KeepAlive,
    connector: C,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<Event>,
}

impl<C: Connector> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            // Nobody listening is fine.
            let _ = self.events.send(event);
        }
    }

    pub(crate) fn policy(&self) -> KeepAlive {
        self.policy
    }

    /// Closes the current link, stops keepalive and moves to disconnected.
    fn teardown(
        &self,
        inner: &mut Inner,
        cause: Option<MqttError>,
        graceful: bool,
    ) -> Option<JoinHandle<()>> {
        let writer = inner.link.take().and_then(|link| link.close(graceful));
        if let Some(handle) = inner.keepalive.take() {
            handle.abort();
        }
        let events = inner.state.set_state(ConnectionState::Disconnected, cause);
        self.emit(events);
        writer
    }

    /// Handles one packet read from link `epoch`. Returns false when the
    /// reader should stop.
    fn dispatch(self: &Arc<Self>, epoch: u64, packet: Packet) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(epoch) {
            return false;
        }
        trace!("Received {:?}", packet.packet_type());

        let outcome = inner.state.handle_packet(packet, Instant::now());
        for packet in &outcome.outgoing {
            if let Err(err) = inner.send(packet) {
                warn!("Failed to queue {:?}: {err}", packet.packet_type());
            }
        }
        self.emit(outcome.events);

        let Some(Close { cause, reconnect }) = outcome.close else {
            return true;
        };
        self.teardown(&mut inner, cause, false);
        let reconnect = reconnect && !inner.user_disconnected;
        drop(inner);
        if reconnect {
            self.schedule_reconnect();
        }
        false
    }

    /// Called by a link task when its stream fails or closes.
    fn link_lost(self: &Arc<Self>, epoch: u64, cause: MqttError) {
        let mut inner = self.lock();
        if !inner.is_current(epoch) {
            return;
        }
        warn!("Connection lost: {cause}");
        self.teardown(&mut inner, Some(cause), false);
        let reconnect = !inner.user_disconnected;
        drop(inner);
        if reconnect {
            self.schedule_reconnect();
        }
    }

    /// Starts the reconnect task unless it is already running or not wanted.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        if !self.options.auto_reconnect {
            return;
        }
        let mut inner = self.lock();
        if inner.user_disconnected || inner.reconnecting {
            return;
        }
        inner.reconnecting = true;
        inner.reconnect = Some(tokio::spawn(keepalive::reconnect_loop(Arc::downgrade(self))));
    }

    pub(crate) fn reconnect_step(&self) -> ReconnectStep {
        let mut inner = self.lock();
        let idle = inner.state.idle_for(Instant::now());

        let step = if !self.options.auto_reconnect || inner.user_disconnected {
            ReconnectStep::Stop
        } else if idle >= self.policy.reconnect_window {
            info!("Giving up reconnecting: broker silent for {idle:?}");
            ReconnectStep::Stop
        } else if inner.state.connection() == ConnectionState::Disconnected {
            ReconnectStep::Attempt
        } else {
            ReconnectStep::Stop
        };

        if step == ReconnectStep::Stop {
            inner.reconnecting = false;
        }
        step
    }

    /// One keepalive probe for link `epoch`. Returns false when the probe
    /// loop should stop.
    pub(crate) fn keepalive_tick(self: &Arc<Self>, epoch: u64) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        if inner.link.is_none() {
            drop(inner);
            self.schedule_reconnect();
            return false;
        }

        let idle = inner.state.idle_for(Instant::now());
        if idle >= self.policy.dead_after {
            warn!("Broker silent for {idle:?}, dropping connection");
            self.teardown(&mut inner, Some(MqttError::KeepAliveTimeout), false);
            let reconnect = !inner.user_disconnected;
            drop(inner);
            if reconnect {
                self.schedule_reconnect();
            }
            return false;
        }

        debug!("Sending PINGREQ");
        if let Err(err) = inner.send(&Packet::PingReq) {
            warn!("Failed to queue PINGREQ: {err}");
        }
        true
    }
}

/// Opens a new link and sends CONNECT. Only an application call (`user`)
/// lifts a previous `disconnect`; the reconnect task gives up instead.
///
/// Boxed so the reconnect task, which calls it, can be spawned from inside
/// the tasks it spawns.
pub(crate) fn connect<C: Connector>(
    shared: Arc<Shared<C>>,
    user: bool,
) -> BoxFuture<'static, Result<(), MqttError>> {
    async move {
        {
            let mut inner = shared.lock();
            if inner.state.connection() != ConnectionState::Disconnected {
                return Err(MqttError::AlreadyConnected);
            }
            if user {
                inner.user_disconnected = false;
            } else if inner.user_disconnected {
                return Err(MqttError::NotConnected);
            }
        }

        let options = &shared.options;
        let port = options.port();
        info!("Connecting to {}:{port}", options.host);
        let stream = shared
            .connector
            .open(&options.host, port, options.tls)
            .await
            .inspect_err(|err| warn!("Failed to connect to {}:{port}: {err}", options.host))?;

        let mut inner = shared.lock();
        if inner.state.connection() != ConnectionState::Disconnected {
            return Err(MqttError::AlreadyConnected);
        }
        if inner.user_disconnected {
            return Err(MqttError::NotConnected);
        }

        inner.epoch += 1;
        let epoch = inner.epoch;
        let weak = Arc::downgrade(&shared);
        let (frames, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(weak.clone(), epoch, stream.writer, rx));
        let reader = tokio::spawn(read_loop(
            weak.clone(),
            epoch,
            stream.reader,
            options.buffer_size,
        ));
        inner.link = Some(Link {
            epoch,
            frames,
            reader,
            writer,
        });

        let events = inner.state.set_state(ConnectionState::Connecting, None);
        shared.emit(events);

        if let Err(err) = inner.send(&Packet::Connect(options.connect_packet())) {
            warn!("Failed to send CONNECT: {err}");
            shared.teardown(&mut inner, Some(err.clone()), false);
            return Err(err);
        }

        if let Some(handle) = inner.keepalive.take() {
            handle.abort();
        }
        if let Some(interval) = shared.policy.interval {
            inner.keepalive = Some(tokio::spawn(keepalive::keepalive_loop(
                weak, epoch, interval,
            )));
        }
        Ok(())
    }
    .boxed()
}

async fn write_loop<C: Connector>(
    shared: Weak<Shared<C>>,
    epoch: u64,
    mut writer: BoxWriter,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = frames.recv().await {
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            if let Some(session) = shared.upgrade() {
                session.link_lost(epoch, TransportError::from(err).into());
            }
            return;
        }
    }

    // The link was closed on purpose once every sender is gone.
    if let Err(err) = writer.shutdown().await {
        debug!("Error shutting down stream: {err}");
    }
}

async fn read_loop<C: Connector>(
    shared: Weak<Shared<C>>,
    epoch: u64,
    mut reader: BoxReader,
    buffer_size: usize,
) {
    let mut decoder = Decoder::new();
    let mut buf = BytesMut::with_capacity(buffer_size);

    let cause = 'read: loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(packet)) => {
                    let Some(session) = shared.upgrade() else {
                        return;
                    };
                    if !session.dispatch(epoch, packet) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) if err.is_fatal() => break 'read MqttError::from(err),
                Err(err) => warn!("Dropping malformed packet: {err}"),
            }
        }

        buf.reserve(buffer_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break MqttError::ConnectionClosed,
            Ok(n) => trace!("Read {n} bytes"),
            Err(err) => break MqttError::from(TransportError::from(err)),
        }
    };

    if let Some(session) = shared.upgrade() {
        session.link_lost(epoch, cause);
    }
}

/// An MQTT 3.1.1 client session.
///
/// Created once with its options; `connect` may be called again after the
/// session drops to disconnected. Notifications arrive on the receiver
/// returned by `new`.
pub struct Session<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Session<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> Session<C> {
    pub fn new(options: Options, connector: C) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let policy = KeepAlive::from_options(&options);
        let inner = Inner {
            state: SessionState::new(Instant::now()),
            epoch: 0,
            link: None,
            keepalive: None,
            reconnect: None,
            reconnecting: false,
            user_disconnected: false,
        };
        let shared = Arc::new(Shared {
            options,
            policy,
            connector,
            inner: Mutex::new(inner),
            events,
        });
        (Self { shared }, rx)
    }

    /// Opens the transport and sends CONNECT.
    ///
    /// Resolves once CONNECT is queued; `Event::Connected` follows when the
    /// broker accepts. Fails with `AlreadyConnected` unless disconnected.
    pub fn connect(&self) -> BoxFuture<'static, Result<(), MqttError>> {
        connect(self.shared.clone(), true)
    }

    /// Sends DISCONNECT, closes the link and stops both timers. No automatic
    /// reconnect happens until `connect` is called again.
    pub async fn disconnect(&self) {
        let writer = {
            let mut inner = self.shared.lock();
            inner.user_disconnected = true;
            inner.reconnecting = false;
            if let Some(handle) = inner.reconnect.take() {
                handle.abort();
            }
            if inner.link.is_some() {
                info!("Disconnecting");
                if let Err(err) = inner.send(&Packet::Disconnect) {
                    debug!("Could not queue DISCONNECT: {err}");
                }
            }
            self.shared.teardown(&mut inner, None, true)
        };

        if let Some(writer) = writer {
            if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, writer)
                .await
                .is_err()
            {
                warn!("Timed out flushing DISCONNECT");
            }
        }
    }

    /// Publishes `message`. Returns the packet identifier for QoS 1 and 2,
    /// which stay pending (and are retransmitted) until acknowledged, even
    /// across reconnects. QoS 0 needs a live connection.
    pub fn publish(&self, message: Message) -> Result<Option<u16>, MqttError> {
        if !valid_topic_name(&message.topic) {
            return Err(MqttError::InvalidTopicName(message.topic));
        }

        let mut inner = self.shared.lock();
        if message.qos == QoS::AtMostOnce {
            let publish = inner.state.delivery_mut().publish(&message)?;
            inner.send(&Packet::Publish(publish))?;
            return Ok(None);
        }

        let publish = inner.state.delivery_mut().publish(&message)?;
        let pkid = publish.pkid;
        inner.send_tracked(&Packet::Publish(publish), pkid)?;
        Ok(Some(pkid))
    }

    pub fn publish_to(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>, MqttError> {
        self.publish(Message::new(topic, payload, qos).with_retain(retain))
    }

    /// Subscribes to `topics`, requesting QoS 2 for each.
    pub fn subscribe<I, S>(&self, topics: I) -> Result<u16, MqttError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_with_qos(topics.into_iter().map(|topic| (topic, QoS::ExactlyOnce)))
    }

    pub fn subscribe_with_qos<I, S>(&self, filters: I) -> Result<u16, MqttError>
    where
        I: IntoIterator<Item = (S, QoS)>,
        S: Into<String>,
    {
        let filters: Vec<SubscribeFilter> = filters
            .into_iter()
            .map(|(path, qos)| SubscribeFilter::new(path, qos))
            .collect();
        if filters.is_empty() {
            return Err(MqttError::EmptyTopicList);
        }
        if let Some(invalid) = filters.iter().find(|f| !valid_topic_filter(&f.path)) {
            return Err(MqttError::InvalidTopicFilter(invalid.path.clone()));
        }

        let mut inner = self.shared.lock();
        let subscribe = inner.state.delivery_mut().subscribe(filters)?;
        let pkid = subscribe.pkid;
        inner.send_tracked(&Packet::Subscribe(subscribe), pkid)?;
        Ok(pkid)
    }

    pub fn unsubscribe<I, S>(&self, topics: I) -> Result<u16, MqttError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(MqttError::EmptyTopicList);
        }
        if let Some(invalid) = topics.iter().find(|topic| !valid_topic_filter(topic)) {
            return Err(MqttError::InvalidTopicFilter(invalid.clone()));
        }

        let mut inner = self.shared.lock();
        let unsubscribe = inner.state.delivery_mut().unsubscribe(topics)?;
        let pkid = unsubscribe.pkid;
        inner.send_tracked(&Packet::Unsubscribe(unsubscribe), pkid)?;
        Ok(pkid)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state.connection()
    }

    /// Packets waiting for the broker to finish their handshake.
    pub fn pending(&self) -> usize {
        self.shared.lock().state.delivery().len()
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }
}
