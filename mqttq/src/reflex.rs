//! Reflex chain: handlers for incoming packets.
//!
//! The input pump hands every frame to [`ReflexChain::dispatch`]. Each
//! [`Reflex`] in turn either handles the frame or passes it on; a frame no
//! reflex claims is a protocol violation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{DisconnectReason, Error, Result};
use crate::protocol::packet::{Ack, AckKind, Disconnect, Publish, SubAck, UnsubAck};
use crate::pump::LinkContext;
use crate::store::{AckOutcome, AckPayload, AckStage};
use crate::types::{FixedHeader, Message, PacketType, QoS};

/// What a reflex did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Fully processed.
    Handled,
    /// Not for this reflex.
    Next,
    /// Processed, and the connection must end.
    Close(DisconnectReason),
}

/// A handler for one or more incoming packet types.
#[async_trait]
pub trait Reflex: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &LinkContext, header: &FixedHeader, body: &Bytes) -> Result<Outcome>;
}

/// Ordered list of reflexes.
#[derive(Clone, Default)]
pub struct ReflexChain {
    reflexes: Vec<Arc<dyn Reflex>>,
}

impl ReflexChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reflex; earlier reflexes see frames first.
    pub fn with(mut self, reflex: impl Reflex + 'static) -> Self {
        self.reflexes.push(Arc::new(reflex));
        self
    }

    /// The reflexes of a client connection.
    pub fn standard() -> Self {
        Self::new()
            .with(PublishReflex)
            .with(AckReflex)
            .with(PubRelReflex)
            .with(SubAckReflex)
            .with(UnsubAckReflex)
            .with(PingRespReflex)
            .with(DisconnectReflex)
    }

    pub fn len(&self) -> usize {
        self.reflexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reflexes.is_empty()
    }

    /// Run `header`/`body` through the chain.
    pub async fn dispatch(&self, ctx: &LinkContext, header: &FixedHeader, body: Bytes) -> Result<Outcome> {
        for reflex in &self.reflexes {
            match reflex.process(ctx, header, &body).await? {
                Outcome::Next => continue,
                outcome => {
                    trace!("{:?} handled by {}", header.packet_type, reflex.name());
                    return Ok(outcome);
                }
            }
        }
        Err(Error::UnexpectedPacket {
            expected: "a packet a broker sends to a client".into(),
            got: format!("{:?}", header.packet_type),
        })
    }
}

impl std::fmt::Debug for ReflexChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.reflexes.iter().map(|r| r.name()))
            .finish()
    }
}

// ============================================================================
// Incoming publishes
// ============================================================================

/// Delivers PUBLISH to the sink and answers per QoS.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishReflex;

#[async_trait]
impl Reflex for PublishReflex {
    fn name(&self) -> &'static str {
        "publish"
    }

    async fn process(&self, ctx: &LinkContext, header: &FixedHeader, body: &Bytes) -> Result<Outcome> {
        if header.packet_type != PacketType::Publish {
            return Ok(Outcome::Next);
        }
        let publish = Publish::decode(header.flags, body.clone(), ctx.version())?;
        let id = publish.packet_id;
        let qos = publish.qos;
        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos,
            retain: publish.retain,
        };

        match qos {
            QoS::AtMostOnce => ctx.sink.on_message(message).await,
            QoS::AtLeastOnce => {
                ctx.sink.on_message(message).await;
                ctx.reply(Arc::new(Ack::new(AckKind::PubAck, id))).await;
            }
            QoS::ExactlyOnce => {
                if ctx.session.dedup().begin(id) {
                    ctx.sink.on_message(message).await;
                } else {
                    debug!("duplicate QoS 2 publish id {}, not delivering", id);
                }
                ctx.reply(Arc::new(Ack::new(AckKind::PubRec, id))).await;
            }
        }
        Ok(Outcome::Handled)
    }
}

/// Completes an incoming QoS 2 flow.
#[derive(Debug, Clone, Copy, Default)]
pub struct PubRelReflex;

#[async_trait]
impl Reflex for PubRelReflex {
    fn name(&self) -> &'static str {
        "pubrel"
    }

    async fn process(&self, ctx: &LinkContext, header: &FixedHeader, body: &Bytes) -> Result<Outcome> {
        if header.packet_type != PacketType::PubRel {
            return Ok(Outcome::Next);
        }
        let release = Ack::decode(AckKind::PubRel, body.clone(), ctx.version())?;
        if !ctx.session.dedup().release(release.packet_id) {
            // PUBCOMP lost on a previous connection
            trace!("PUBREL for unheld id {}", release.packet_id);
        }
        ctx.reply(Arc::new(Ack::new(AckKind::PubComp, release.packet_id))).await;
        Ok(Outcome::Handled)
    }
}

// ============================================================================
// Acknowledgements of our packets
// ============================================================================

fn unknown_ack(kind: &str, packet_id: u16) -> Error {
    Error::Protocol(format!("{kind} for unknown packet id {packet_id}"))
}

/// PUBACK, PUBREC and PUBCOMP.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckReflex;

#[async_trait]
impl Reflex for AckReflex {
    fn name(&self) -> &'static str {
        "ack"
    }

    async fn process(&self, ctx: &LinkContext, header: &FixedHeader, body: &Bytes) -> Result<Outcome> {
        let (kind, stage) = match header.packet_type {
            PacketType::PubAck => (AckKind::PubAck, AckStage::Single),
            PacketType::PubRec => (AckKind::PubRec, AckStage::Received),
            PacketType::PubComp => (AckKind::PubComp, AckStage::Completed),
            _ => return Ok(Outcome::Next),
        };
        let ack = Ack::decode(kind, body.clone(), ctx.version())?;
        let payload = AckPayload::Published { reason_code: ack.reason_code };

        match ctx.session.ids().ack(ack.packet_id, payload, stage) {
            AckOutcome::Completed => {}
            AckOutcome::Release(release) => ctx.reply(release).await,
            AckOutcome::Duplicate => trace!("repeated PUBREC for id {}", ack.packet_id),
            AckOutcome::Unknown => return Err(unknown_ack(&format!("{kind:?}"), ack.packet_id)),
        }
        Ok(Outcome::Handled)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubAckReflex;

#[async_trait]
impl Reflex for SubAckReflex {
    fn name(&self) -> &'static str {
        "suback"
    }

    async fn process(&self, ctx: &LinkContext, header: &FixedHeader, body: &Bytes) -> Result<Outcome> {
        if header.packet_type != PacketType::SubAck {
            return Ok(Outcome::Next);
        }
        let suback = SubAck::decode(body.clone(), ctx.version())?;
        let payload = AckPayload::Subscribed { return_codes: suback.return_codes };
        match ctx.session.ids().ack(suback.packet_id, payload, AckStage::Single) {
            AckOutcome::Unknown => Err(unknown_ack("SubAck", suback.packet_id)),
            _ => Ok(Outcome::Handled),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsubAckReflex;

#[async_trait]
impl Reflex for UnsubAckReflex {
    fn name(&self) -> &'static str {
        "unsuback"
    }

    async fn process(&self, ctx: &LinkContext, header: &FixedHeader, body: &Bytes) -> Result<Outcome> {
        if header.packet_type != PacketType::UnsubAck {
            return Ok(Outcome::Next);
        }
        let unsuback = UnsubAck::decode(body.clone(), ctx.version())?;
        let payload = AckPayload::Unsubscribed { reason_codes: unsuback.reason_codes };
        match ctx.session.ids().ack(unsuback.packet_id, payload, AckStage::Single) {
            AckOutcome::Unknown => Err(unknown_ack("UnsubAck", unsuback.packet_id)),
            _ => Ok(Outcome::Handled),
        }
    }
}

// ============================================================================
// Connection control
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct PingRespReflex;

#[async_trait]
impl Reflex for PingRespReflex {
    fn name(&self) -> &'static str {
        "pingresp"
    }

    async fn process(&self, ctx: &LinkContext, header: &FixedHeader, body: &Bytes) -> Result<Outcome> {
        if header.packet_type != PacketType::PingResp {
            return Ok(Outcome::Next);
        }
        if !body.is_empty() {
            return Err(Error::Malformed("PINGRESP with body"));
        }
        let mut keep_alive = ctx.keep_alive.lock();
        if keep_alive.ping_sent_at.take().is_none() {
            trace!("unsolicited PINGRESP");
        }
        Ok(Outcome::Handled)
    }
}

/// Server-sent DISCONNECT (MQTT 5).
#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectReflex;

#[async_trait]
impl Reflex for DisconnectReflex {
    fn name(&self) -> &'static str {
        "disconnect"
    }

    async fn process(&self, ctx: &LinkContext, header: &FixedHeader, body: &Bytes) -> Result<Outcome> {
        if header.packet_type != PacketType::Disconnect {
            return Ok(Outcome::Next);
        }
        let disconnect = Disconnect::decode(body.clone(), ctx.version())?;
        debug!("broker sent DISCONNECT (reason {:#04x})", disconnect.reason_code);
        let reason = match disconnect.reason_code {
            0 => DisconnectReason::RemoteDisconnected,
            code => DisconnectReason::RemoteReason(code),
        };
        Ok(Outcome::Close(reason))
    }
}
