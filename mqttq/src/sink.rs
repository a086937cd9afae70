//! Consumer callback surface.
//!
//! The engine reports connection changes, delivered messages and
//! diagnostics through a [`Sink`]. Two implementations ship with the crate:
//! [`ChannelSink`] forwards everything as [`Notification`]s over an mpsc
//! channel, [`LogSink`] writes everything to `tracing`.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::DisconnectReason;
use crate::types::Message;

/// Diagnostic events raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SinkEvent {
    /// A packet was retransmitted.
    PacketResent { packet_id: u16, attempt: u16 },
    /// The identifier table is full; an allocation is waiting.
    StoreFilling { live: usize, capacity: usize },
    /// A packet exhausted its resend budget and was dropped.
    PoisonousPacket { packet_id: u16, attempts: u16 },
    /// The peer broke the protocol; the connection is being torn down.
    ProtocolViolation { detail: String },
    /// A QoS 0 message was discarded because the outgoing queue was full.
    MessageDropped { topic: String },
    /// A reconnection attempt failed.
    ReconnectFailed { attempt: u32, error: String },
}

impl SinkEvent {
    /// Render the event as a JSON object.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// Receives connection, message and diagnostic callbacks.
///
/// Callbacks run on the engine's pump tasks: `on_message` may suspend (the
/// input pump waits for it before reading the next frame), the others must
/// return promptly.
#[async_trait]
pub trait Sink: Send + Sync {
    /// A connection was accepted by the broker.
    fn on_connected(&self, _session_present: bool) {}

    /// A connection ended.
    fn on_disconnected(&self, _reason: &DisconnectReason) {}

    /// An application message arrived.
    async fn on_message(&self, message: Message);

    /// A diagnostic event was raised.
    fn on_event(&self, _event: SinkEvent) {}
}

/// Everything a [`ChannelSink`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Connected { session_present: bool },
    Disconnected(DisconnectReason),
    Message(Message),
    Event(SinkEvent),
}

/// Sink that forwards every callback over a bounded channel.
///
/// Messages wait for channel capacity; connection changes and events are
/// dropped when the channel is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Notification>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn notify(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            debug!("sink channel: dropping notification: {}", e);
        }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    fn on_connected(&self, session_present: bool) {
        self.notify(Notification::Connected { session_present });
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        self.notify(Notification::Disconnected(reason.clone()));
    }

    async fn on_message(&self, message: Message) {
        if self.tx.send(Notification::Message(message)).await.is_err() {
            debug!("sink channel closed, message discarded");
        }
    }

    fn on_event(&self, event: SinkEvent) {
        self.notify(Notification::Event(event));
    }
}

/// Sink that logs every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    fn on_connected(&self, session_present: bool) {
        info!("connected, session_present={}", session_present);
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        info!("disconnected: {}", reason);
    }

    async fn on_message(&self, message: Message) {
        debug!(
            "message on {} ({} bytes, {:?})",
            message.topic,
            message.payload.len(),
            message.qos
        );
    }

    fn on_event(&self, event: SinkEvent) {
        match &event {
            SinkEvent::PacketResent { .. } | SinkEvent::StoreFilling { .. } => {
                debug!("{}", event.to_json())
            }
            _ => warn!("{}", event.to_json()),
        }
    }
}
