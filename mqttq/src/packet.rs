//! Outgoing packets as the delivery engine sees them.
//!
//! The identifier store and the output pump only need a handful of things
//! from a packet: its identifier, its QoS, whether the identifier belongs to
//! the peer, and a way to serialize it. [`OutgoingPacket`] captures exactly
//! that, so the engine never matches on concrete packet kinds.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::Result;
use crate::protocol::packet::{Ack, AckKind, Publish, Subscribe, Unsubscribe};
use crate::types::{PacketType, ProtocolVersion, QoS};

/// A packet the client may transmit.
pub trait OutgoingPacket: Send + Sync + fmt::Debug {
    /// Control packet type.
    fn packet_type(&self) -> PacketType;

    /// Packet identifier, 0 when none is assigned.
    fn packet_id(&self) -> u16;

    /// Assign the packet identifier. Called once by the identifier store.
    fn set_packet_id(&mut self, id: u16);

    /// Delivery guarantee the packet is tracked with.
    fn qos(&self) -> QoS;

    /// Whether the identifier was assigned by the peer. Such packets
    /// (replies in incoming QoS 1/2 flows) are never placed in the
    /// identifier store.
    fn is_remote_owned(&self) -> bool {
        false
    }

    /// Serialize a complete frame. `resend` is true for retransmissions.
    fn encode(&self, version: ProtocolVersion, resend: bool, buf: &mut BytesMut) -> Result<()>;
}

/// Shared handle to a stored packet.
pub type SharedPacket = Arc<dyn OutgoingPacket>;

/// Whether two handles point at the same stored packet.
pub fn same_packet(a: &SharedPacket, b: &SharedPacket) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl OutgoingPacket for Publish {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn packet_id(&self) -> u16 {
        self.packet_id
    }

    fn set_packet_id(&mut self, id: u16) {
        self.packet_id = id;
    }

    fn qos(&self) -> QoS {
        self.qos
    }

    fn encode(&self, version: ProtocolVersion, resend: bool, buf: &mut BytesMut) -> Result<()> {
        self.encode_with_dup(version, self.dup || resend, buf)
    }
}

impl OutgoingPacket for Ack {
    fn packet_type(&self) -> PacketType {
        self.kind.packet_type()
    }

    fn packet_id(&self) -> u16 {
        self.packet_id
    }

    fn set_packet_id(&mut self, id: u16) {
        self.packet_id = id;
    }

    fn qos(&self) -> QoS {
        match self.kind {
            AckKind::PubRel => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    // PUBREL continues our own QoS 2 flow; the other three answer the peer.
    fn is_remote_owned(&self) -> bool {
        self.kind != AckKind::PubRel
    }

    fn encode(&self, version: ProtocolVersion, _resend: bool, buf: &mut BytesMut) -> Result<()> {
        Ack::encode(self, version, buf)
    }
}

impl OutgoingPacket for Subscribe {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn packet_id(&self) -> u16 {
        self.packet_id
    }

    fn set_packet_id(&mut self, id: u16) {
        self.packet_id = id;
    }

    fn qos(&self) -> QoS {
        QoS::AtLeastOnce
    }

    fn encode(&self, version: ProtocolVersion, _resend: bool, buf: &mut BytesMut) -> Result<()> {
        Subscribe::encode(self, version, buf)
    }
}

impl OutgoingPacket for Unsubscribe {
    fn packet_type(&self) -> PacketType {
        PacketType::Unsubscribe
    }

    fn packet_id(&self) -> u16 {
        self.packet_id
    }

    fn set_packet_id(&mut self, id: u16) {
        self.packet_id = id;
    }

    fn qos(&self) -> QoS {
        QoS::AtLeastOnce
    }

    fn encode(&self, version: ProtocolVersion, _resend: bool, buf: &mut BytesMut) -> Result<()> {
        Unsubscribe::encode(self, version, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_resend_sets_dup() {
        let mut publish = Publish::new("t", &b"x"[..], QoS::AtLeastOnce);
        publish.set_packet_id(9);

        let mut first = BytesMut::new();
        OutgoingPacket::encode(&publish, ProtocolVersion::V4, false, &mut first).unwrap();
        let mut again = BytesMut::new();
        OutgoingPacket::encode(&publish, ProtocolVersion::V4, true, &mut again).unwrap();

        assert_eq!(first[0], 0x32);
        assert_eq!(again[0], 0x3A);
        assert_eq!(&first[1..], &again[1..]);
    }

    #[test]
    fn test_qos0_resend_never_sets_dup() {
        let publish = Publish::new("t", &b"x"[..], QoS::AtMostOnce);
        let mut buf = BytesMut::new();
        OutgoingPacket::encode(&publish, ProtocolVersion::V4, true, &mut buf).unwrap();
        assert_eq!(buf[0], 0x30);
    }

    #[test]
    fn test_ack_ownership() {
        assert!(Ack::new(AckKind::PubAck, 1).is_remote_owned());
        assert!(Ack::new(AckKind::PubComp, 1).is_remote_owned());
        assert!(!Ack::new(AckKind::PubRel, 1).is_remote_owned());
        assert_eq!(Ack::new(AckKind::PubRel, 1).qos(), QoS::ExactlyOnce);
    }

    #[test]
    fn test_same_packet() {
        let a: SharedPacket = Arc::new(Ack::new(AckKind::PubRel, 1));
        let b: SharedPacket = Arc::new(Ack::new(AckKind::PubRel, 1));
        assert!(same_packet(&a, &a.clone()));
        assert!(!same_packet(&a, &b));
    }
}
