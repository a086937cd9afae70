//! MQTT client delivery engine with QoS 1 and QoS 2 tracking.
//!
//! mqttq keeps every in-flight packet in an identifier store, resends what
//! the broker has not acknowledged, and carries that state across
//! reconnects when the broker resumes the session.
//!
//! ## Components
//!
//! - [`Client`]: connection lifecycle, reconnect loop and the user API
//! - [`IdentifierStore`]: packet identifiers we own and their ack state
//! - [`DedupStore`]: identifiers of incoming QoS 2 messages awaiting PUBREL
//! - [`OutputPump`](pump::OutputPump) / [`InputPump`](pump::InputPump): the
//!   single writer and single reader of a connection
//! - [`ReflexChain`]: handlers for incoming packets
//! - [`Sink`]: where messages, connection changes and diagnostics go
//!
//! ## Protocol Support
//!
//! | Protocol | Protocol Level | Support |
//! |----------|---------------|---------|
//! | MQTT 3.1 | 3 | ✅ |
//! | MQTT 3.1.1 | 4 (v4) | ✅ |
//! | MQTT 5.0 | 5 (v5) | ✅ Reason codes; properties are skipped |
//!
//! ## Example
//!
//! ```no_run
//! use giztoy_mqttq::{ChannelSink, Client, ClientConfig, Notification, QoS, TcpConnector};
//!
//! #[tokio::main]
//! async fn main() -> giztoy_mqttq::Result<()> {
//!     let (sink, mut notifications) = ChannelSink::new(64);
//!     let config = ClientConfig::new("client-1").with_clean_session(false);
//!     let client = Client::connect(config, TcpConnector::new("127.0.0.1:1883"), sink).await?;
//!
//!     client.subscribe(&[("test/#", QoS::AtLeastOnce)]).await?.await?;
//!     client.publish("test/topic", "hello", QoS::ExactlyOnce).await?.await?;
//!
//!     while let Some(Notification::Message(msg)) = notifications.recv().await {
//!         println!("Received: {:?}", msg);
//!     }
//!
//!     client.disconnect().await
//! }
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod packet;
pub mod protocol;
pub mod pump;
pub mod reflex;
pub mod session;
pub mod sink;
pub mod store;
pub mod topic;
pub mod transport;
pub mod types;

pub use client::{Client, ConnectionState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ClientConfig;
pub use error::{DisconnectReason, Error, Result};
pub use packet::{OutgoingPacket, SharedPacket};
pub use reflex::{Outcome, Reflex, ReflexChain};
pub use session::Session;
pub use sink::{ChannelSink, LogSink, Notification, Sink, SinkEvent};
pub use store::{AckFuture, AckPayload, DedupStore, IdentifierStore};
pub use transport::{Connector, MemoryConnector, TcpConnector, Transport};
pub use types::{LastWill, Message, ProtocolVersion, QoS};
