//! Session state carried across connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::packet::SharedPacket;
use crate::sink::Sink;
use crate::store::{DedupStore, IdentifierStore};

/// The identifier store and dedup store of one client, plus whether the
/// current connection resumed them.
#[derive(Debug)]
pub struct Session {
    ids: IdentifierStore,
    dedup: DedupStore,
    resumed: AtomicBool,
}

impl Session {
    pub fn new(config: &ClientConfig, clock: Arc<dyn Clock>, sink: Arc<dyn Sink>) -> Self {
        Self {
            ids: IdentifierStore::new(config, clock, sink),
            dedup: DedupStore::new(),
            resumed: AtomicBool::new(false),
        }
    }

    pub fn ids(&self) -> &IdentifierStore {
        &self.ids
    }

    pub fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    /// Whether the current connection resumed an existing session.
    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::Acquire)
    }

    /// Apply the broker's session decision for a new connection.
    ///
    /// A clean start discards both stores. A resumed session keeps them and
    /// returns the packets that must be written again, oldest first.
    pub fn begin(&self, resumed: bool) -> Vec<SharedPacket> {
        self.resumed.store(resumed, Ordering::Release);
        if resumed {
            let replay = self.ids.prepare_replay();
            debug!("session resumed, replaying {} packets", replay.len());
            replay
        } else {
            self.ids.reset();
            self.dedup.reset();
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::protocol::packet::Publish;
    use crate::sink::LogSink;
    use crate::types::QoS;

    fn session() -> Session {
        Session::new(&ClientConfig::new("s"), Arc::new(ManualClock::new()), Arc::new(LogSink))
    }

    #[tokio::test]
    async fn test_clean_start_clears_both_stores() {
        let session = session();
        let allocation = session
            .ids()
            .allocate(Box::new(Publish::new("t", "x", QoS::AtLeastOnce)))
            .await
            .unwrap();
        session.dedup().begin(9);

        assert!(session.begin(false).is_empty());
        assert!(!session.is_resumed());
        assert!(session.ids().is_empty());
        assert!(session.dedup().is_empty());
        assert!(matches!(allocation.ack.await, Err(Error::SessionReset)));
    }

    #[tokio::test]
    async fn test_resume_keeps_state() {
        let session = session();
        let allocation = session
            .ids()
            .allocate(Box::new(Publish::new("t", "x", QoS::AtLeastOnce)))
            .await
            .unwrap();
        session.dedup().begin(9);

        // never written, so nothing to replay, but still tracked
        assert!(session.begin(true).is_empty());
        assert!(session.is_resumed());
        assert!(session.ids().entry_state(allocation.id).is_some());
        assert!(session.dedup().contains(9));
    }
}
