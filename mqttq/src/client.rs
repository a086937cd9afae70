//! MQTT client with at-least-once and exactly-once delivery.
//!
//! A [`Client`] owns one session (identifier store plus dedup store) for its
//! whole life and runs it over a sequence of connections. Each connection
//! gets an input pump and an output pump; a supervisor task waits for the
//! connection to go down, reports why, and reconnects with exponential
//! backoff unless the user disconnected.
//!
//! ```ignore
//! let connector = TcpConnector::new("tcp://127.0.0.1:1883");
//! let (sink, mut notifications) = ChannelSink::new(64);
//! let client = Client::connect(ClientConfig::new("sensor-1"), connector, sink).await?;
//!
//! let ack = client.publish("sensors/temp", "21.5", QoS::AtLeastOnce).await?;
//! ack.await?;
//! client.disconnect().await?;
//! ```

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::error::{DisconnectReason, Error, Result};
use crate::packet::OutgoingPacket;
use crate::protocol::codec::read_fixed_header_from;
use crate::protocol::packet::{ConnAck, Connect, Disconnect, Publish, Subscribe, Unsubscribe};
use crate::pump::{DisconnectLatch, InputPump, LinkContext, OutgoingItem, OutputPump, Pump};
use crate::reflex::ReflexChain;
use crate::session::Session;
use crate::sink::{Sink, SinkEvent};
use crate::store::{AckFuture, AckPayload};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::Connector;
use crate::types::{Message, PacketType, QoS};

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff before the next attempt.
    Reconnecting,
}

/// Handle to a running client. Cheap to clone.
///
/// Dropping the last handle shuts the client down as if
/// [`Client::disconnect`] had been called, without waiting for it.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Exchanger>,
    _shutdown: Arc<DropGuard>,
}

/// One live connection: its pumps and the latch they trip.
struct Link {
    close: CancellationToken,
    latch: DisconnectLatch,
    input: Pump,
    output: Pump,
}

/// Owns everything the pumps of successive connections share.
struct Exchanger {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,
    session: Arc<Session>,
    chain: Arc<ReflexChain>,
    messages: mpsc::Sender<OutgoingItem>,
    messages_rx: Arc<AsyncMutex<mpsc::Receiver<OutgoingItem>>>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Connect to a broker.
    ///
    /// Fails if the first connection cannot be established; later
    /// connection losses are handled by the reconnect loop.
    pub async fn connect(
        config: ClientConfig,
        connector: impl Connector + 'static,
        sink: impl Sink + 'static,
    ) -> Result<Self> {
        Self::connect_with(config, Arc::new(connector), Arc::new(sink), Arc::new(SystemClock::new())).await
    }

    /// Connect with shared collaborators and an explicit clock.
    pub async fn connect_with(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn Sink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let session = Arc::new(Session::new(&config, clock.clone(), sink.clone()));
        let (messages, messages_rx) = mpsc::channel(config.queue_capacity);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let exchanger = Arc::new(Exchanger {
            config,
            connector,
            sink,
            clock,
            session,
            chain: Arc::new(ReflexChain::standard()),
            messages,
            messages_rx: Arc::new(AsyncMutex::new(messages_rx)),
            state,
            link: Mutex::new(None),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });

        exchanger.set_state(ConnectionState::Connecting);
        if let Err(e) = exchanger.establish().await {
            warn!("connect failed: {}", e);
            exchanger.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let supervisor = tokio::spawn(exchanger.clone().supervise());
        *exchanger.supervisor.lock() = Some(supervisor);
        let shutdown = Arc::new(exchanger.shutdown.clone().drop_guard());
        Ok(Self {
            inner: exchanger,
            _shutdown: shutdown,
        })
    }

    /// Publish `payload` to `topic`.
    ///
    /// QoS 0 resolves at once with [`AckPayload::Queued`]; if the outgoing
    /// queue is full the message is discarded and a
    /// [`SinkEvent::MessageDropped`] is raised. QoS 1 and 2 wait for a free
    /// packet identifier and resolve when the broker acknowledges.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> Result<AckFuture> {
        self.publish_message(Message {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain: false,
        })
        .await
    }

    /// Publish a prepared message, honoring its QoS and retain flag.
    pub async fn publish_message(&self, message: Message) -> Result<AckFuture> {
        self.inner.ensure_open()?;
        validate_topic_name(&message.topic)?;
        self.inner.check_publish_size(&message)?;

        let mut publish = Publish::new(message.topic, message.payload, message.qos);
        publish.retain = message.retain;

        if message.qos == QoS::AtMostOnce {
            let topic = publish.topic.clone();
            return match self.inner.messages.try_send(OutgoingItem::Packet(Arc::new(publish))) {
                Ok(()) => Ok(AckFuture::ready(Ok(AckPayload::Queued))),
                Err(TrySendError::Full(_)) => {
                    debug!("outgoing queue full, dropping QoS 0 message on {}", topic);
                    self.inner.sink.on_event(SinkEvent::MessageDropped { topic });
                    Ok(AckFuture::ready(Ok(AckPayload::Queued)))
                }
                Err(TrySendError::Closed(_)) => Err(Error::NotConnected),
            };
        }

        self.inner.submit(Box::new(publish)).await
    }

    /// Subscribe to `filters`. Resolves with the SUBACK return codes.
    pub async fn subscribe(&self, filters: &[(&str, QoS)]) -> Result<AckFuture> {
        self.inner.ensure_open()?;
        if filters.is_empty() {
            return Err(Error::InvalidTopic("no filters".into()));
        }
        for (filter, _) in filters {
            validate_topic_filter(filter)?;
        }
        debug!("subscribing to {:?}", filters);
        let subscribe = Subscribe {
            packet_id: 0,
            filters: filters.iter().map(|(f, q)| (f.to_string(), *q)).collect(),
        };
        self.inner.submit(Box::new(subscribe)).await
    }

    /// Unsubscribe from `filters`. Resolves with the UNSUBACK reason codes
    /// (empty before MQTT 5).
    pub async fn unsubscribe(&self, filters: &[&str]) -> Result<AckFuture> {
        self.inner.ensure_open()?;
        if filters.is_empty() {
            return Err(Error::InvalidTopic("no filters".into()));
        }
        for filter in filters {
            validate_topic_filter(filter)?;
        }
        debug!("unsubscribing from {:?}", filters);
        let unsubscribe = Unsubscribe {
            packet_id: 0,
            filters: filters.iter().map(|f| f.to_string()).collect(),
        };
        self.inner.submit(Box::new(unsubscribe)).await
    }

    /// Send DISCONNECT after everything already queued, then stop for good.
    ///
    /// If the DISCONNECT cannot be written within the disconnect timeout
    /// the connection is closed without it. Pending acknowledgements fail
    /// with [`Error::Cancelled`].
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Ok(());
        }
        debug!("disconnecting");

        let latch = inner.link.lock().as_ref().map(|link| link.latch.clone());
        if let Some(latch) = latch {
            let graceful = async {
                let item = OutgoingItem::Disconnect(Disconnect::default());
                if inner.messages.send(item).await.is_ok() {
                    latch.wait().await;
                }
            };
            tokio::select! {
                _ = graceful => {}
                _ = inner.clock.sleep(inner.config.disconnect_timeout) => {
                    warn!("DISCONNECT not written within {:?}, closing", inner.config.disconnect_timeout);
                }
            }
        }

        inner.shutdown.cancel();
        let supervisor = inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                debug!("supervisor ended abnormally: {}", e);
            }
        }
        inner.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Packets holding an identifier (sent or waiting to be).
    pub fn in_flight(&self) -> usize {
        self.inner.session.ids().len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.config.client_id)
            .field("state", &self.state())
            .field("session", &self.inner.session)
            .finish()
    }
}

impl Exchanger {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!("connection state {:?} -> {:?}", previous, state);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(Error::NotConnected)
        } else {
            Ok(())
        }
    }

    fn check_publish_size(&self, message: &Message) -> Result<()> {
        let mut size = 2 + message.topic.len() + message.payload.len();
        if message.qos != QoS::AtMostOnce {
            size += 2;
        }
        if self.config.protocol_version.is_v5() {
            size += 1;
        }
        let max = self.config.max_packet_size;
        if size > max {
            return Err(Error::PacketTooLarge { size, max });
        }
        Ok(())
    }

    /// Allocate an identifier for `packet` and queue it.
    async fn submit(&self, packet: Box<dyn OutgoingPacket>) -> Result<AckFuture> {
        let allocation = self.session.ids().allocate(packet).await?;
        trace!("queued {:?} id {}", allocation.packet.packet_type(), allocation.id);
        self.messages
            .send(OutgoingItem::Packet(allocation.packet))
            .await
            .map_err(|_| Error::NotConnected)?;
        Ok(allocation.ack)
    }

    /// Open a transport, handshake, and start the pumps.
    async fn establish(&self) -> Result<()> {
        let mut transport = self.connector.connect().await?;

        let clean = self.config.clean_session;
        let session_present = tokio::select! {
            r = handshake(&self.config, clean, &mut transport) => r?,
            _ = self.clock.sleep(self.config.connect_timeout) => {
                return Err(Error::Timeout(format!("no CONNACK within {:?}", self.config.connect_timeout)));
            }
        };

        let replay = self.session.begin(session_present);
        let (reader, writer) = tokio::io::split(transport);
        let (ctx, replies) = LinkContext::new(
            self.config.clone(),
            self.session.clone(),
            self.sink.clone(),
            self.clock.clone(),
        );
        let messages = self.messages_rx.clone().lock_owned().await;

        let close = self.shutdown.child_token();
        let latch = DisconnectLatch::new();
        let output_ctx = ctx.clone();
        let output = Pump::spawn("output", &close, latch.clone(), move |stop, close| {
            OutputPump::new(output_ctx, writer, replies, messages, replay).run(stop, close)
        });
        let chain = self.chain.clone();
        let input = Pump::spawn("input", &close, latch.clone(), move |stop, close| {
            InputPump::new(ctx, reader, chain).run(stop, close)
        });

        *self.link.lock() = Some(Link { close, latch, input, output });
        self.set_state(ConnectionState::Connected);
        info!("connected as {} (session_present={})", self.config.client_id, session_present);
        self.sink.on_connected(session_present);
        Ok(())
    }

    /// Wait for each connection to go down and bring up the next one.
    async fn supervise(self: Arc<Self>) {
        loop {
            let latch = self.link.lock().as_ref().map(|link| link.latch.clone());
            let Some(latch) = latch else {
                break;
            };
            let reason = tokio::select! {
                reason = latch.wait() => reason,
                _ = self.shutdown.cancelled() => DisconnectReason::User,
            };
            self.teardown(&reason).await;

            if !reason.allows_reconnect() || !self.config.auto_reconnect || self.shutdown.is_cancelled() {
                break;
            }
            if !self.reconnect().await {
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        debug!("supervisor stopped");
    }

    async fn teardown(&self, reason: &DisconnectReason) {
        if let DisconnectReason::ProtocolViolation(detail) = reason {
            warn!("protocol violation: {}", detail);
            self.sink.on_event(SinkEvent::ProtocolViolation { detail: detail.clone() });
        }

        let link = self.link.lock().take();
        if let Some(link) = link {
            link.shut(*reason == DisconnectReason::User, self.config.disconnect_timeout, &self.clock)
                .await;
        }

        self.session.ids().cancel_all();
        self.set_state(ConnectionState::Disconnected);
        info!("disconnected: {}", reason);
        self.sink.on_disconnected(reason);
    }

    /// Retry with exponential backoff until connected or shut down.
    async fn reconnect(&self) -> bool {
        let mut delay = self.config.reconnect_delay;
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Reconnecting);
            debug!("reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = self.clock.sleep(delay) => {}
            }

            attempt += 1;
            self.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                r = self.establish() => r,
            };
            match result {
                Ok(()) => return true,
                Err(e) => {
                    warn!("reconnect attempt {} failed: {}", attempt, e);
                    self.sink.on_event(SinkEvent::ReconnectFailed {
                        attempt,
                        error: e.to_string(),
                    });
                    delay = (delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }
    }
}

impl Link {
    /// Stop the pumps. A graceful shut lets the input pump finish the frame
    /// in hand, bounded by `grace`; otherwise both are closed at once.
    async fn shut(self, graceful: bool, grace: std::time::Duration, clock: &Arc<dyn Clock>) {
        let Link { close, input, output, .. } = self;
        if graceful {
            input.stop();
            output.stop();
        } else {
            close.cancel();
        }

        let joined = async {
            input.join().await;
            output.join().await;
        };
        tokio::pin!(joined);
        if graceful {
            tokio::select! {
                _ = &mut joined => return,
                _ = clock.sleep(grace) => debug!("pumps still busy after {:?}, closing", grace),
            }
            close.cancel();
        }
        joined.await;
    }
}

/// Write CONNECT and read CONNACK. Returns whether the broker resumed a
/// session.
async fn handshake<S>(config: &ClientConfig, clean: bool, stream: &mut S) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = config.protocol_version;
    let mut connect = Connect::new(version, config.client_id.clone());
    connect.keep_alive = config.keep_alive;
    connect.clean_session = clean;
    connect.username = config.username.clone();
    connect.password = config.password.clone();
    connect.will = config.will.clone();
    connect.session_expiry = config.session_expiry;

    let mut buf = BytesMut::new();
    connect.encode(version, &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    debug!("CONNECT sent ({}, clean={})", version, clean);

    let header = read_fixed_header_from(stream).await?.ok_or(Error::ConnectionClosed)?;
    if header.packet_type != PacketType::ConnAck {
        return Err(Error::UnexpectedPacket {
            expected: "ConnAck".into(),
            got: format!("{:?}", header.packet_type),
        });
    }
    let len = header.remaining_length as usize;
    if len > config.max_packet_size {
        return Err(Error::PacketTooLarge { size: len, max: config.max_packet_size });
    }
    let mut body = BytesMut::zeroed(len);
    stream.read_exact(&mut body).await?;
    let connack = ConnAck::decode(body.freeze(), version)?;

    if connack.code != 0 {
        return Err(Error::ConnectionRefused(connack.code));
    }
    if clean && connack.session_present {
        return Err(Error::Protocol("broker resumed a session on a clean start".into()));
    }
    Ok(connack.session_present)
}
