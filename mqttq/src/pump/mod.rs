//! Pumps: one background loop per transport direction.
//!
//! Each pump runs with two tokens. `stop` asks it to finish the work in hand
//! and exit; `close` aborts every wait at once. The stop token is a child of
//! the close token, so closing implies stopping. A pump that ends with an
//! error (or panics) trips the link's [`DisconnectLatch`]; the first reason
//! wins and wakes the supervisor.

pub mod input;
pub mod output;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::DisconnectReason;
use crate::packet::SharedPacket;
use crate::protocol::packet::Disconnect;
use crate::session::Session;
use crate::sink::Sink;

pub use input::InputPump;
pub use output::OutputPump;

/// Items accepted by the message queue.
#[derive(Debug)]
pub enum OutgoingItem {
    /// A packet to write (QoS 0 publish or a freshly allocated packet).
    Packet(SharedPacket),
    /// Write DISCONNECT and close the connection.
    Disconnect(Disconnect),
}

/// How a pump ended. `Err` carries the reason the link must go down.
pub type PumpExit = std::result::Result<(), DisconnectReason>;

// ============================================================================
// Disconnect latch
// ============================================================================

/// One-shot record of why a link is going down.
#[derive(Debug, Clone, Default)]
pub struct DisconnectLatch {
    inner: Arc<LatchInner>,
}

#[derive(Debug, Default)]
struct LatchInner {
    reason: Mutex<Option<DisconnectReason>>,
    tripped: CancellationToken,
}

impl DisconnectLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` unless a reason is already recorded. Returns whether
    /// this call tripped the latch.
    pub fn trip(&self, reason: DisconnectReason) -> bool {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_some() {
                trace!("latch already tripped, ignoring {}", reason);
                return false;
            }
            *slot = Some(reason);
        }
        self.inner.tripped.cancel();
        true
    }

    pub fn reason(&self) -> Option<DisconnectReason> {
        self.inner.reason.lock().clone()
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.is_cancelled()
    }

    /// Wait until the latch trips and return the recorded reason.
    pub async fn wait(&self) -> DisconnectReason {
        self.inner.tripped.cancelled().await;
        self.reason()
            .unwrap_or_else(|| DisconnectReason::InternalException("latch tripped without reason".into()))
    }
}

// ============================================================================
// Link context
// ============================================================================

/// Keep-alive bookkeeping shared by both pumps.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAlive {
    /// Clock time of the last write.
    pub last_write: Duration,
    /// Clock time the outstanding PINGREQ was written.
    pub ping_sent_at: Option<Duration>,
}

/// State shared by the pumps and reflexes of one connection.
pub struct LinkContext {
    pub config: Arc<ClientConfig>,
    pub session: Arc<Session>,
    pub sink: Arc<dyn Sink>,
    pub clock: Arc<dyn Clock>,
    /// Reflex queue: control replies written ahead of user messages.
    pub replies: mpsc::Sender<SharedPacket>,
    pub keep_alive: Mutex<KeepAlive>,
}

impl LinkContext {
    pub fn new(
        config: Arc<ClientConfig>,
        session: Arc<Session>,
        sink: Arc<dyn Sink>,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Self>, mpsc::Receiver<SharedPacket>) {
        let (replies, replies_rx) = mpsc::channel(config.queue_capacity.max(1));
        let keep_alive = KeepAlive {
            last_write: clock.now(),
            ping_sent_at: None,
        };
        let ctx = Arc::new(Self {
            config,
            session,
            sink,
            clock,
            replies,
            keep_alive: Mutex::new(keep_alive),
        });
        (ctx, replies_rx)
    }

    pub fn version(&self) -> crate::types::ProtocolVersion {
        self.config.protocol_version
    }

    /// Queue a control reply ahead of user messages.
    pub async fn reply(&self, packet: SharedPacket) {
        let kind = packet.packet_type();
        if self.replies.send(packet).await.is_err() {
            debug!("output pump gone, dropping {:?} reply", kind);
        }
    }
}

impl std::fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkContext")
            .field("client_id", &self.config.client_id)
            .field("keep_alive", &*self.keep_alive.lock())
            .finish()
    }
}

// ============================================================================
// Pump handle
// ============================================================================

/// Handle to a running pump.
#[derive(Debug)]
pub struct Pump {
    name: &'static str,
    stop: CancellationToken,
    close: CancellationToken,
    task: JoinHandle<()>,
}

impl Pump {
    /// Spawn a pump. `run` receives the stop and close tokens; the close
    /// token is a child of `parent`.
    pub fn spawn<F, Fut>(name: &'static str, parent: &CancellationToken, latch: DisconnectLatch, run: F) -> Self
    where
        F: FnOnce(CancellationToken, CancellationToken) -> Fut,
        Fut: Future<Output = PumpExit> + Send + 'static,
    {
        let close = parent.child_token();
        let stop = close.child_token();
        let body = run(stop.clone(), close.clone());

        let task = tokio::spawn(async move {
            debug!("{} pump started", name);
            match AssertUnwindSafe(body).catch_unwind().await {
                Ok(Ok(())) => debug!("{} pump stopped", name),
                Ok(Err(reason)) => {
                    debug!("{} pump failed: {}", name, reason);
                    latch.trip(reason);
                }
                Err(panic) => {
                    let reason = DisconnectReason::InternalException(format!(
                        "{} pump panicked: {}",
                        name,
                        panic_message(panic.as_ref())
                    ));
                    debug!("{}", reason);
                    latch.trip(reason);
                }
            }
        });

        Self { name, stop, close, task }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the pump to finish its current work and exit.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Abort the pump immediately.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the pump task to end.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            debug!("{} pump task ended abnormally: {}", self.name, e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latch_first_reason_wins() {
        let latch = DisconnectLatch::new();
        assert!(!latch.is_tripped());
        assert!(latch.trip(DisconnectReason::KeepAliveTimeout));
        assert!(!latch.trip(DisconnectReason::User));
        assert_eq!(latch.wait().await, DisconnectReason::KeepAliveTimeout);
    }

    #[tokio::test]
    async fn test_pump_error_trips_latch() {
        let latch = DisconnectLatch::new();
        let parent = CancellationToken::new();
        let pump = Pump::spawn("test", &parent, latch.clone(), |_, _| async {
            Err(DisconnectReason::RemoteDisconnected)
        });
        pump.join().await;
        assert_eq!(latch.reason(), Some(DisconnectReason::RemoteDisconnected));
    }

    #[tokio::test]
    async fn test_pump_panic_is_internal_exception() {
        let latch = DisconnectLatch::new();
        let parent = CancellationToken::new();
        fn explode() -> PumpExit {
            panic!("handler blew up")
        }
        let pump = Pump::spawn("test", &parent, latch.clone(), |_, _| async { explode() });
        pump.join().await;
        match latch.reason() {
            Some(DisconnectReason::InternalException(msg)) => assert!(msg.contains("handler blew up")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_implies_stop() {
        let latch = DisconnectLatch::new();
        let parent = CancellationToken::new();
        let pump = Pump::spawn("test", &parent, latch.clone(), |stop, _close| async move {
            stop.cancelled().await;
            Ok(())
        });
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), pump.join()).await.unwrap();
        assert!(!latch.is_tripped());
    }
}
