//! MQTT wire protocol.
//!
//! [`codec`] holds the framing primitives shared by every packet kind,
//! [`packet`] the per-packet bodies for MQTT 3.1, 3.1.1 and 5.0.

pub mod codec;
pub mod packet;

pub use codec::{read_fixed_header, read_fixed_header_from, MAX_VARIABLE_INT};
pub use packet::{
    Ack, AckKind, ConnAck, Connect, Disconnect, Packet, Publish, SubAck, Subscribe, UnsubAck,
    Unsubscribe,
};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;
