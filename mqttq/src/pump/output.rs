//! Output pump: the only writer of a connection.
//!
//! Each iteration writes at most one queued item (control replies before
//! user messages), then every resend the identifier store reports due, then
//! a PINGREQ if the link has been idle for the ping interval. When nothing
//! was written it sleeps until the earliest of: a queued item, the next
//! resend deadline, the keep-alive deadline, a dropped-entry signal, or
//! cancellation.
//!
//! Tracked packets are marked sent in the identifier store before their
//! bytes reach the transport, so an ack can never overtake the record of
//! the write it answers.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{LinkContext, OutgoingItem, PumpExit};
use crate::error::DisconnectReason;
use crate::packet::SharedPacket;
use crate::protocol::codec::write_frame;
use crate::sink::SinkEvent;
use crate::store::ResendScan;
use crate::types::{PacketType, QoS};

enum KeepAliveAction {
    Wait(Option<Duration>),
    Ping,
    TimedOut,
}

enum Wake {
    Close,
    Stop,
    Reply(Option<SharedPacket>),
    Message(Option<OutgoingItem>),
    Timer,
}

/// Writer loop of one connection.
pub struct OutputPump<W> {
    ctx: Arc<LinkContext>,
    writer: W,
    replies: mpsc::Receiver<SharedPacket>,
    messages: OwnedMutexGuard<mpsc::Receiver<OutgoingItem>>,
    replay: Vec<SharedPacket>,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin + Send> OutputPump<W> {
    pub fn new(
        ctx: Arc<LinkContext>,
        writer: W,
        replies: mpsc::Receiver<SharedPacket>,
        messages: OwnedMutexGuard<mpsc::Receiver<OutgoingItem>>,
        replay: Vec<SharedPacket>,
    ) -> Self {
        Self {
            ctx,
            writer,
            replies,
            messages,
            replay,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn run(mut self, stop: CancellationToken, close: CancellationToken) -> PumpExit {
        // Resumed session: everything written before goes out first, in
        // allocation order.
        for packet in std::mem::take(&mut self.replay) {
            if close.is_cancelled() {
                return Ok(());
            }
            self.send(packet, true, &close).await?;
        }

        loop {
            if close.is_cancelled() || stop.is_cancelled() {
                return Ok(());
            }

            let mut sent = false;

            if let Ok(packet) = self.replies.try_recv() {
                self.send(packet, false, &close).await?;
                sent = true;
            } else if let Ok(item) = self.messages.try_recv() {
                self.send_item(item, &close).await?;
                sent = true;
            }

            let resend_wait = loop {
                match self.ctx.session.ids().get_oldest_due_for_resend(self.ctx.config.ack_timeout) {
                    ResendScan::Due(packet) => {
                        self.send(packet, true, &close).await?;
                        sent = true;
                    }
                    ResendScan::Idle(wait) => break wait,
                }
            };

            let keep_alive_wait = match self.keep_alive_action() {
                KeepAliveAction::Wait(wait) => wait,
                KeepAliveAction::Ping => {
                    self.send_ping(&close).await?;
                    sent = true;
                    None
                }
                KeepAliveAction::TimedOut => {
                    warn!("no PINGRESP within {:?}", self.ctx.config.ping_timeout);
                    return Err(DisconnectReason::KeepAliveTimeout);
                }
            };

            if sent {
                continue;
            }

            let wait = match (resend_wait, keep_alive_wait) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let clock = self.ctx.clock.clone();
            let timer = async move {
                match wait {
                    Some(d) => clock.sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let ids = self.ctx.session.ids();

            let wake = tokio::select! {
                biased;
                _ = close.cancelled() => Wake::Close,
                _ = stop.cancelled() => Wake::Stop,
                p = self.replies.recv() => Wake::Reply(p),
                m = self.messages.recv() => Wake::Message(m),
                _ = ids.dropped() => Wake::Timer,
                _ = timer => Wake::Timer,
            };

            match wake {
                Wake::Close | Wake::Stop => return Ok(()),
                Wake::Reply(Some(packet)) => self.send(packet, false, &close).await?,
                Wake::Message(Some(item)) => self.send_item(item, &close).await?,
                Wake::Reply(None) | Wake::Message(None) => {
                    debug!("outgoing queue closed");
                    return Ok(());
                }
                Wake::Timer => {}
            }
        }
    }

    async fn send_item(&mut self, item: OutgoingItem, close: &CancellationToken) -> PumpExit {
        match item {
            OutgoingItem::Packet(packet) => self.send(packet, false, close).await,
            OutgoingItem::Disconnect(disconnect) => {
                self.buf.clear();
                disconnect
                    .encode(self.ctx.version(), &mut self.buf)
                    .map_err(|e| DisconnectReason::InternalException(e.to_string()))?;
                self.write_buf(close).await?;
                if let Err(e) = self.writer.shutdown().await {
                    trace!("shutdown after DISCONNECT: {}", e);
                }
                debug!("DISCONNECT written");
                Err(DisconnectReason::User)
            }
        }
    }

    /// Encode, record and write one packet.
    async fn send(&mut self, packet: SharedPacket, resend: bool, close: &CancellationToken) -> PumpExit {
        self.buf.clear();
        if let Err(e) = packet.encode(self.ctx.version(), resend, &mut self.buf) {
            return Err(DisconnectReason::InternalException(format!(
                "encode {:?}: {}",
                packet.packet_type(),
                e
            )));
        }

        let id = packet.packet_id();
        let tracked = !packet.is_remote_owned() && packet.qos() != QoS::AtMostOnce;
        if tracked {
            let Some(attempt) = self.ctx.session.ids().mark_sent(id, &packet) else {
                trace!("skipping stale {:?} id {}", packet.packet_type(), id);
                return Ok(());
            };
            if attempt > 1 {
                debug!("resending {:?} id {} (attempt {})", packet.packet_type(), id, attempt);
                self.ctx.sink.on_event(SinkEvent::PacketResent { packet_id: id, attempt });
            }
        }

        trace!("writing {:?} id {} ({} bytes)", packet.packet_type(), id, self.buf.len());
        self.write_buf(close).await
    }

    async fn send_ping(&mut self, close: &CancellationToken) -> PumpExit {
        self.buf.clear();
        write_frame(&mut self.buf, PacketType::PingReq, 0, &[])
            .map_err(|e| DisconnectReason::InternalException(e.to_string()))?;
        self.ctx.keep_alive.lock().ping_sent_at = Some(self.ctx.clock.now());
        trace!("sending PINGREQ");
        self.write_buf(close).await
    }

    /// Write the buffered frame. A forced close abandons the write.
    async fn write_buf(&mut self, close: &CancellationToken) -> PumpExit {
        let writer = &mut self.writer;
        let buf = &self.buf;
        let result = tokio::select! {
            biased;
            _ = close.cancelled() => return Ok(()),
            r = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => r,
        };
        match result {
            Ok(()) => {
                self.ctx.keep_alive.lock().last_write = self.ctx.clock.now();
                Ok(())
            }
            Err(e) => {
                debug!("write failed: {}", e);
                Err(DisconnectReason::TransportError(e.to_string()))
            }
        }
    }

    fn keep_alive_action(&self) -> KeepAliveAction {
        let Some(interval) = self.ctx.config.ping_interval() else {
            return KeepAliveAction::Wait(None);
        };
        let now = self.ctx.clock.now();
        let state = self.ctx.keep_alive.lock();
        match state.ping_sent_at {
            Some(sent_at) => {
                let deadline = sent_at + self.ctx.config.ping_timeout;
                if now >= deadline {
                    KeepAliveAction::TimedOut
                } else {
                    KeepAliveAction::Wait(Some(deadline - now))
                }
            }
            None => {
                let due = state.last_write + interval;
                if now >= due {
                    KeepAliveAction::Ping
                } else {
                    KeepAliveAction::Wait(Some(due - now))
                }
            }
        }
    }
}
