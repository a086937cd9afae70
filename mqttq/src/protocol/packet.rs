//! Packet bodies for MQTT 3.1, 3.1.1 and 5.0.
//!
//! Properties are written empty (apart from the CONNECT ones the client
//! sets) and skipped when read. Reason codes are kept where v5 carries them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::{
    get_binary, get_packet_id, get_string, get_u16, get_u8, put_binary, put_string,
    skip_properties, write_frame, write_variable_int,
};
use crate::error::{Error, Result};
use crate::types::{FixedHeader, LastWill, PacketType, ProtocolVersion, QoS};

// ============================================================================
// Packet enum
// ============================================================================

/// Any decoded MQTT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
}

impl Packet {
    /// Decode a packet body given its fixed header.
    pub fn decode(header: &FixedHeader, body: Bytes, version: ProtocolVersion) -> Result<Packet> {
        Ok(match header.packet_type {
            PacketType::Connect => Packet::Connect(Connect::decode(body)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::decode(body, version)?),
            PacketType::Publish => Packet::Publish(Publish::decode(header.flags, body, version)?),
            PacketType::PubAck => Packet::PubAck(Ack::decode(AckKind::PubAck, body, version)?),
            PacketType::PubRec => Packet::PubRec(Ack::decode(AckKind::PubRec, body, version)?),
            PacketType::PubRel => Packet::PubRel(Ack::decode(AckKind::PubRel, body, version)?),
            PacketType::PubComp => Packet::PubComp(Ack::decode(AckKind::PubComp, body, version)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::decode(body, version)?),
            PacketType::SubAck => Packet::SubAck(SubAck::decode(body, version)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::decode(body, version)?),
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::decode(body, version)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect(Disconnect::decode(body, version)?),
            PacketType::Auth => {
                return Err(Error::Protocol("AUTH is not supported".into()));
            }
        })
    }

    /// Encode the packet as a complete frame.
    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        match self {
            Packet::Connect(p) => p.encode(version, buf),
            Packet::ConnAck(p) => p.encode(version, buf),
            Packet::Publish(p) => p.encode(version, buf),
            Packet::PubAck(p) | Packet::PubRec(p) | Packet::PubRel(p) | Packet::PubComp(p) => {
                p.encode(version, buf)
            }
            Packet::Subscribe(p) => p.encode(version, buf),
            Packet::SubAck(p) => p.encode(version, buf),
            Packet::Unsubscribe(p) => p.encode(version, buf),
            Packet::UnsubAck(p) => p.encode(version, buf),
            Packet::PingReq => write_frame(buf, PacketType::PingReq, 0, &[]),
            Packet::PingResp => write_frame(buf, PacketType::PingResp, 0, &[]),
            Packet::Disconnect(p) => p.encode(version, buf),
        }
    }

    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "Connect",
            Packet::ConnAck(_) => "ConnAck",
            Packet::Publish(_) => "Publish",
            Packet::PubAck(_) => "PubAck",
            Packet::PubRec(_) => "PubRec",
            Packet::PubRel(_) => "PubRel",
            Packet::PubComp(_) => "PubComp",
            Packet::Subscribe(_) => "Subscribe",
            Packet::SubAck(_) => "SubAck",
            Packet::Unsubscribe(_) => "Unsubscribe",
            Packet::UnsubAck(_) => "UnsubAck",
            Packet::PingReq => "PingReq",
            Packet::PingResp => "PingResp",
            Packet::Disconnect(_) => "Disconnect",
        }
    }
}

// ============================================================================
// CONNECT / CONNACK
// ============================================================================

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<LastWill>,
    /// Session expiry interval (v5 only).
    pub session_expiry: Option<u32>,
    /// Receive maximum (v5 only).
    pub receive_maximum: Option<u16>,
}

impl Connect {
    /// Create a CONNECT for the given client id.
    pub fn new(version: ProtocolVersion, client_id: impl Into<String>) -> Self {
        Self {
            protocol_version: version,
            client_id: client_id.into(),
            keep_alive: 60,
            clean_session: true,
            username: None,
            password: None,
            will: None,
            session_expiry: None,
            receive_maximum: None,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.username.is_some() {
            flags |= 0x80;
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if let Some(will) = &self.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.clean_session {
            flags |= 0x02;
        }
        flags
    }

    /// Encode as a complete frame. The version stored in the packet wins.
    pub fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        let version = self.protocol_version;
        let mut body = BytesMut::with_capacity(32 + self.client_id.len());
        put_string(&mut body, version.protocol_name())?;
        body.put_u8(version.level());
        body.put_u8(self.flags());
        body.put_u16(self.keep_alive);

        if version.is_v5() {
            let mut props = BytesMut::new();
            if let Some(expiry) = self.session_expiry {
                props.put_u8(0x11);
                props.put_u32(expiry);
            }
            if let Some(max) = self.receive_maximum {
                props.put_u8(0x21);
                props.put_u16(max);
            }
            write_variable_int(&mut body, props.len() as u32)?;
            body.put_slice(&props);
        }

        put_string(&mut body, &self.client_id)?;
        if let Some(will) = &self.will {
            if version.is_v5() {
                body.put_u8(0); // will properties
            }
            put_string(&mut body, &will.topic)?;
            put_binary(&mut body, &will.payload)?;
        }
        if let Some(username) = &self.username {
            put_string(&mut body, username)?;
        }
        if let Some(password) = &self.password {
            put_binary(&mut body, password)?;
        }

        write_frame(buf, PacketType::Connect, 0, &body)
    }

    /// Decode a CONNECT body (broker side; used by test peers).
    pub fn decode(mut body: Bytes) -> Result<Self> {
        let name = get_string(&mut body)?;
        let level = get_u8(&mut body)?;
        let version = match (name.as_str(), level) {
            ("MQIsdp", 3) => ProtocolVersion::V3,
            ("MQTT", 4) => ProtocolVersion::V4,
            ("MQTT", 5) => ProtocolVersion::V5,
            _ => return Err(Error::Protocol(format!("unsupported protocol {name} level {level}"))),
        };
        let flags = get_u8(&mut body)?;
        if flags & 0x01 != 0 {
            return Err(Error::Protocol("reserved connect flag set".into()));
        }
        let keep_alive = get_u16(&mut body)?;
        if version.is_v5() {
            skip_properties(&mut body)?;
        }
        let client_id = get_string(&mut body)?;

        let will = if flags & 0x04 != 0 {
            if version.is_v5() {
                skip_properties(&mut body)?;
            }
            let topic = get_string(&mut body)?;
            let payload = get_binary(&mut body)?;
            let qos = QoS::from_u8((flags >> 3) & 0x03).ok_or(Error::Malformed("will qos 3"))?;
            Some(LastWill {
                topic,
                payload,
                qos,
                retain: flags & 0x20 != 0,
            })
        } else {
            None
        };
        let username = if flags & 0x80 != 0 { Some(get_string(&mut body)?) } else { None };
        let password = if flags & 0x40 != 0 { Some(get_binary(&mut body)?) } else { None };

        Ok(Self {
            protocol_version: version,
            client_id,
            keep_alive,
            clean_session: flags & 0x02 != 0,
            username,
            password,
            will,
            session_expiry: None,
            receive_maximum: None,
        })
    }
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    /// Return code (v3/v4) or reason code (v5); 0 means accepted.
    pub code: u8,
}

impl ConnAck {
    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::with_capacity(3);
        body.put_u8(self.session_present as u8);
        body.put_u8(self.code);
        if version.is_v5() {
            body.put_u8(0);
        }
        write_frame(buf, PacketType::ConnAck, 0, &body)
    }

    pub fn decode(mut body: Bytes, version: ProtocolVersion) -> Result<Self> {
        let flags = get_u8(&mut body)?;
        if flags & 0xFE != 0 {
            return Err(Error::Protocol("reserved connack flags set".into()));
        }
        let code = get_u8(&mut body)?;
        if version.is_v5() && body.has_remaining() {
            skip_properties(&mut body)?;
        }
        Ok(Self {
            session_present: flags & 0x01 != 0,
            code,
        })
    }
}

// ============================================================================
// PUBLISH and its acknowledgements
// ============================================================================

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Zero for QoS 0.
    pub packet_id: u16,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            packet_id: 0,
        }
    }

    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        self.encode_with_dup(version, self.dup, buf)
    }

    /// Encode with an explicit DUP flag (set on retransmissions).
    pub fn encode_with_dup(&self, version: ProtocolVersion, dup: bool, buf: &mut BytesMut) -> Result<()> {
        let dup = dup && self.qos != QoS::AtMostOnce;
        let flags = ((dup as u8) << 3) | ((self.qos as u8) << 1) | self.retain as u8;
        let mut body = BytesMut::with_capacity(self.topic.len() + self.payload.len() + 5);
        put_string(&mut body, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            if self.packet_id == 0 {
                return Err(Error::Protocol("qos > 0 publish without packet id".into()));
            }
            body.put_u16(self.packet_id);
        }
        if version.is_v5() {
            body.put_u8(0);
        }
        body.put_slice(&self.payload);
        write_frame(buf, PacketType::Publish, flags, &body)
    }

    pub fn decode(flags: u8, mut body: Bytes, version: ProtocolVersion) -> Result<Self> {
        let qos = QoS::from_u8((flags >> 1) & 0x03).ok_or(Error::Malformed("publish qos 3"))?;
        let dup = flags & 0x08 != 0;
        if dup && qos == QoS::AtMostOnce {
            return Err(Error::Protocol("dup flag on qos 0 publish".into()));
        }
        let topic = get_string(&mut body)?;
        let packet_id = if qos == QoS::AtMostOnce { 0 } else { get_packet_id(&mut body)? };
        if version.is_v5() {
            skip_properties(&mut body)?;
        }
        Ok(Self {
            topic,
            payload: body,
            qos,
            retain: flags & 0x01 != 0,
            dup,
            packet_id,
        })
    }
}

/// Which acknowledgement an [`Ack`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    PubAck,
    PubRec,
    PubRel,
    PubComp,
}

impl AckKind {
    pub fn packet_type(self) -> PacketType {
        match self {
            AckKind::PubAck => PacketType::PubAck,
            AckKind::PubRec => PacketType::PubRec,
            AckKind::PubRel => PacketType::PubRel,
            AckKind::PubComp => PacketType::PubComp,
        }
    }
}

/// PUBACK, PUBREC, PUBREL or PUBCOMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub kind: AckKind,
    pub packet_id: u16,
    /// v5 reason code; always 0 for earlier versions.
    pub reason_code: u8,
}

impl Ack {
    pub fn new(kind: AckKind, packet_id: u16) -> Self {
        Self {
            kind,
            packet_id,
            reason_code: 0,
        }
    }

    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        let packet_type = self.kind.packet_type();
        let flags = packet_type.required_flags().unwrap_or(0);
        let mut body = BytesMut::with_capacity(3);
        body.put_u16(self.packet_id);
        if version.is_v5() && self.reason_code != 0 {
            body.put_u8(self.reason_code);
        }
        write_frame(buf, packet_type, flags, &body)
    }

    pub fn decode(kind: AckKind, mut body: Bytes, version: ProtocolVersion) -> Result<Self> {
        let packet_id = get_packet_id(&mut body)?;
        let mut reason_code = 0;
        if version.is_v5() && body.has_remaining() {
            reason_code = get_u8(&mut body)?;
            if body.has_remaining() {
                skip_properties(&mut body)?;
            }
        }
        Ok(Self {
            kind,
            packet_id,
            reason_code,
        })
    }
}

// ============================================================================
// SUBSCRIBE / UNSUBSCRIBE
// ============================================================================

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

impl Subscribe {
    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        if self.filters.is_empty() {
            return Err(Error::Protocol("subscribe without filters".into()));
        }
        let mut body = BytesMut::new();
        body.put_u16(self.packet_id);
        if version.is_v5() {
            body.put_u8(0);
        }
        for (filter, qos) in &self.filters {
            put_string(&mut body, filter)?;
            body.put_u8(*qos as u8);
        }
        write_frame(buf, PacketType::Subscribe, 0b0010, &body)
    }

    pub fn decode(mut body: Bytes, version: ProtocolVersion) -> Result<Self> {
        let packet_id = get_packet_id(&mut body)?;
        if version.is_v5() {
            skip_properties(&mut body)?;
        }
        let mut filters = Vec::new();
        while body.has_remaining() {
            let filter = get_string(&mut body)?;
            let options = get_u8(&mut body)?;
            let qos = QoS::from_u8(options & 0x03).ok_or(Error::Malformed("subscribe qos 3"))?;
            filters.push((filter, qos));
        }
        if filters.is_empty() {
            return Err(Error::Protocol("subscribe without filters".into()));
        }
        Ok(Self { packet_id, filters })
    }
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// Granted QoS per filter, or a failure code (>= 0x80).
    pub return_codes: Vec<u8>,
}

impl SubAck {
    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::with_capacity(3 + self.return_codes.len());
        body.put_u16(self.packet_id);
        if version.is_v5() {
            body.put_u8(0);
        }
        body.put_slice(&self.return_codes);
        write_frame(buf, PacketType::SubAck, 0, &body)
    }

    pub fn decode(mut body: Bytes, version: ProtocolVersion) -> Result<Self> {
        let packet_id = get_packet_id(&mut body)?;
        if version.is_v5() {
            skip_properties(&mut body)?;
        }
        Ok(Self {
            packet_id,
            return_codes: body.to_vec(),
        })
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

impl Unsubscribe {
    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        if self.filters.is_empty() {
            return Err(Error::Protocol("unsubscribe without filters".into()));
        }
        let mut body = BytesMut::new();
        body.put_u16(self.packet_id);
        if version.is_v5() {
            body.put_u8(0);
        }
        for filter in &self.filters {
            put_string(&mut body, filter)?;
        }
        write_frame(buf, PacketType::Unsubscribe, 0b0010, &body)
    }

    pub fn decode(mut body: Bytes, version: ProtocolVersion) -> Result<Self> {
        let packet_id = get_packet_id(&mut body)?;
        if version.is_v5() {
            skip_properties(&mut body)?;
        }
        let mut filters = Vec::new();
        while body.has_remaining() {
            filters.push(get_string(&mut body)?);
        }
        Ok(Self { packet_id, filters })
    }
}

/// UNSUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    /// v5 reason code per filter; empty for earlier versions.
    pub reason_codes: Vec<u8>,
}

impl UnsubAck {
    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::with_capacity(3 + self.reason_codes.len());
        body.put_u16(self.packet_id);
        if version.is_v5() {
            body.put_u8(0);
            body.put_slice(&self.reason_codes);
        }
        write_frame(buf, PacketType::UnsubAck, 0, &body)
    }

    pub fn decode(mut body: Bytes, version: ProtocolVersion) -> Result<Self> {
        let packet_id = get_packet_id(&mut body)?;
        let mut reason_codes = Vec::new();
        if version.is_v5() {
            skip_properties(&mut body)?;
            reason_codes = body.to_vec();
        }
        Ok(Self {
            packet_id,
            reason_codes,
        })
    }
}

// ============================================================================
// DISCONNECT
// ============================================================================

/// DISCONNECT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Disconnect {
    /// v5 reason code; 0 is a normal disconnection.
    pub reason_code: u8,
}

impl Disconnect {
    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        if version.is_v5() && self.reason_code != 0 {
            write_frame(buf, PacketType::Disconnect, 0, &[self.reason_code])
        } else {
            write_frame(buf, PacketType::Disconnect, 0, &[])
        }
    }

    pub fn decode(mut body: Bytes, version: ProtocolVersion) -> Result<Self> {
        let mut reason_code = 0;
        if version.is_v5() && body.has_remaining() {
            reason_code = get_u8(&mut body)?;
            if body.has_remaining() {
                skip_properties(&mut body)?;
            }
        } else if body.has_remaining() {
            return Err(Error::Malformed("disconnect with body"));
        }
        Ok(Self { reason_code })
    }
}
