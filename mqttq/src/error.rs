//! Error types for mqttq.

use std::io;

use serde::Serialize;

/// Result type alias for mqttq.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttq operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Protocol violation (malformed frame, bad flags, ack for unknown id, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame could not be decoded.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Buffer ended before the value was complete.
    #[error("incomplete packet: {needed} more bytes needed")]
    Incomplete { needed: usize },

    /// Packet exceeds the configured maximum size.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// Connection refused by broker.
    #[error("connection refused: return code {0:#04x}")]
    ConnectionRefused(u8),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Topic name or filter rejected before sending.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Resend budget exhausted without an acknowledgement.
    #[error("poisonous packet: id {packet_id} unacknowledged after {attempts} attempts")]
    PoisonousPacket { packet_id: u16, attempts: u16 },

    /// The pending operation was cancelled by a forced disconnect.
    #[error("operation cancelled")]
    Cancelled,

    /// The pending operation was discarded by a clean session start.
    #[error("session reset")]
    SessionReset,

    /// No connection is established.
    #[error("not connected")]
    NotConnected,

    /// Unexpected internal fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error tears the connection down as a protocol violation.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Malformed(_)
                | Error::PacketTooLarge { .. }
                | Error::UnexpectedPacket { .. }
        )
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The user asked to disconnect.
    User,
    /// The peer closed the stream, or sent DISCONNECT.
    RemoteDisconnected,
    /// The peer sent a v5 DISCONNECT carrying this reason code.
    RemoteReason(u8),
    /// The peer broke the protocol.
    ProtocolViolation(String),
    /// No PINGRESP arrived within the ping timeout.
    KeepAliveTimeout,
    /// Writing to or reading from the transport failed.
    TransportError(String),
    /// A pump or reflex faulted unexpectedly.
    InternalException(String),
}

impl DisconnectReason {
    /// Map a pump error onto the reason the connection is torn down with.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::ConnectionClosed => DisconnectReason::RemoteDisconnected,
            Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                DisconnectReason::RemoteDisconnected
            }
            Error::Io(e) => DisconnectReason::TransportError(e.to_string()),
            Error::Timeout(_) => DisconnectReason::KeepAliveTimeout,
            e if e.is_protocol_violation() => DisconnectReason::ProtocolViolation(e.to_string()),
            e => DisconnectReason::InternalException(e.to_string()),
        }
    }

    /// Whether the reconnect loop may run after this reason.
    pub fn allows_reconnect(&self) -> bool {
        !matches!(self, DisconnectReason::User)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::User => write!(f, "user disconnect"),
            DisconnectReason::RemoteDisconnected => write!(f, "remote disconnected"),
            DisconnectReason::RemoteReason(code) => write!(f, "remote disconnect, reason {code:#04x}"),
            DisconnectReason::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            DisconnectReason::KeepAliveTimeout => write!(f, "keep-alive timeout"),
            DisconnectReason::TransportError(detail) => write!(f, "transport error: {detail}"),
            DisconnectReason::InternalException(detail) => write!(f, "internal exception: {detail}"),
        }
    }
}
