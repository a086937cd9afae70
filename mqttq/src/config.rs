//! Client configuration.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::{MAX_PACKET_SIZE, MAX_VARIABLE_INT};
use crate::types::{LastWill, ProtocolVersion};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client ID.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Bytes>,
    /// Keep alive interval in seconds. 0 disables keep-alive.
    pub keep_alive: u16,
    /// Clean session flag (v3/v4) / Clean start flag (v5).
    pub clean_session: bool,
    /// Maximum size of an incoming packet's remaining length.
    pub max_packet_size: usize,
    /// Protocol version.
    pub protocol_version: ProtocolVersion,
    /// Session expiry interval in seconds (v5 only).
    pub session_expiry: Option<u32>,
    /// Last will published by the broker if the connection drops.
    pub will: Option<LastWill>,
    /// How long to wait for CONNACK.
    pub connect_timeout: Duration,
    /// How long to wait for an ack before resending.
    pub ack_timeout: Duration,
    /// How long to wait for PINGRESP before giving up on the connection.
    pub ping_timeout: Duration,
    /// Resends allowed before a packet is declared poisonous.
    pub max_resends: u16,
    /// Capacity of the outgoing message queue.
    pub queue_capacity: usize,
    /// Identifier table slots allocated up front.
    pub initial_id_table_size: u16,
    /// Maximum number of identifiers in flight.
    pub max_inflight: u16,
    /// How often a blocked allocation retries while the table is full.
    pub store_retry_interval: Duration,
    /// Reconnect after an unexpected disconnect.
    pub auto_reconnect: bool,
    /// First reconnect delay; doubles on each failure.
    pub reconnect_delay: Duration,
    /// Upper bound for the reconnect delay.
    pub max_reconnect_delay: Duration,
    /// How long a graceful disconnect waits for the pumps to drain.
    pub disconnect_timeout: Duration,
}

impl ClientConfig {
    /// Create a new client config (defaults to MQTT 3.1.1).
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            max_packet_size: MAX_PACKET_SIZE,
            protocol_version: ProtocolVersion::V4,
            session_expiry: None,
            will: None,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(10),
            max_resends: 5,
            queue_capacity: 128,
            initial_id_table_size: 16,
            max_inflight: u16::MAX,
            store_retry_interval: Duration::from_secs(1),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            disconnect_timeout: Duration::from_secs(5),
        }
    }

    /// Set credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set protocol version.
    pub fn with_protocol(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Set session expiry interval (MQTT 5.0 only).
    ///
    /// - `0`: session ends immediately on disconnect
    /// - `n`: session persists for n seconds after disconnect
    /// - `0xFFFFFFFF`: session never expires
    pub fn with_session_expiry(mut self, seconds: u32) -> Self {
        self.session_expiry = Some(seconds);
        self
    }

    /// Set the last will.
    pub fn with_will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    /// Set the maximum incoming packet size.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long to wait for an ack before resending.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Set how many resends a packet gets before it is dropped as poisonous.
    pub fn with_max_resends(mut self, resends: u16) -> Self {
        self.max_resends = resends;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_initial_id_table_size(mut self, size: u16) -> Self {
        self.initial_id_table_size = size;
        self
    }

    /// Limit the number of identifiers in flight.
    pub fn with_max_inflight(mut self, max: u16) -> Self {
        self.max_inflight = max;
        self
    }

    pub fn with_store_retry_interval(mut self, interval: Duration) -> Self {
        self.store_retry_interval = interval;
        self
    }

    /// Enable or disable automatic reconnection.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the initial and maximum reconnect delay.
    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Interval after which an idle connection sends PINGREQ.
    ///
    /// Half the keep-alive, so the broker sees traffic well within its
    /// 1.5x grace period. `None` when keep-alive is disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        if self.keep_alive == 0 {
            return None;
        }
        Some(Duration::from_millis(self.keep_alive as u64 * 500).max(Duration::from_millis(500)))
    }

    /// Check for settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));

        if self.client_id.is_empty() && !self.clean_session {
            return invalid("an empty client id requires a clean session");
        }
        if self.client_id.len() > u16::MAX as usize {
            return invalid("client id too long");
        }
        if self.max_packet_size == 0 || self.max_packet_size > MAX_VARIABLE_INT as usize {
            return invalid("max_packet_size out of range");
        }
        if self.ack_timeout.is_zero() {
            return invalid("ack_timeout must be positive");
        }
        if self.connect_timeout.is_zero() {
            return invalid("connect_timeout must be positive");
        }
        if self.keep_alive > 0 && self.ping_timeout.is_zero() {
            return invalid("ping_timeout must be positive");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be positive");
        }
        if self.max_inflight == 0 || self.initial_id_table_size == 0 {
            return invalid("identifier table sizes must be positive");
        }
        if self.store_retry_interval.is_zero() {
            return invalid("store_retry_interval must be positive");
        }
        if self.reconnect_delay > self.max_reconnect_delay {
            return invalid("reconnect_delay exceeds max_reconnect_delay");
        }
        if let Some(will) = &self.will {
            if will.topic.is_empty() || will.topic.contains(['+', '#']) {
                return invalid("will topic must be a non-empty topic name");
            }
        }
        if self.password.is_some() && self.username.is_none() && !self.protocol_version.is_v5() {
            return invalid("password without username requires MQTT 5.0");
        }
        Ok(())
    }
}
