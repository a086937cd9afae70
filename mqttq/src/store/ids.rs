//! Packet identifier store.
//!
//! Owns the 16-bit identifier space for packets the client originates
//! (QoS 1/2 PUBLISH, SUBSCRIBE, UNSUBSCRIBE). Every live identifier maps to
//! one in-flight entry holding the stored packet, its transmission count,
//! the time it was last written and the completion handle of its caller.
//!
//! Entries are kept in a dense table indexed by `id - 1`. Free slots form a
//! LIFO free list through `next_free`; allocated slots form a doubly linked
//! list in allocation order (`older`/`newer`) so the resend scan and the ack
//! walk can traverse from the oldest live identifier without searching.
//!
//! # Ack resolution
//!
//! The transport preserves byte order and the peer acknowledges in the
//! order it received packets. When an ack for `P` arrives, every older entry
//! last written strictly before `P` cannot produce an ack any more: it is
//! freed if it was already uncertain, otherwise marked dropped so the
//! scheduler resends it at once. The walk is only sound on in-order
//! transports.
//!
//! An ack for an entry written more than once is ambiguous (it may answer an
//! earlier copy). The caller is resolved immediately, but the identifier
//! stays reserved in the uncertain state until a later ack or the ack
//! timeout proves no further ack can arrive.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::packet::{same_packet, OutgoingPacket, SharedPacket};
use crate::protocol::packet::{Ack, AckKind};
use crate::sink::{Sink, SinkEvent};
use crate::types::{PacketType, QoS};

const NONE: u16 = 0;

// ============================================================================
// Ack payloads and futures
// ============================================================================

/// What an acknowledged operation resolved with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckPayload {
    /// QoS 0 publish handed to the outgoing queue; nothing is acknowledged.
    Queued,
    /// PUBACK or PUBCOMP. `reason_code` is 0 before MQTT 5.
    Published { reason_code: u8 },
    /// SUBACK return codes, one per filter.
    Subscribed { return_codes: Vec<u8> },
    /// UNSUBACK reason codes (MQTT 5 only).
    Unsubscribed { reason_codes: Vec<u8> },
}

impl AckPayload {
    /// Whether the peer reported a failure reason code (MQTT 5, `>= 0x80`).
    pub fn is_failure(&self) -> bool {
        matches!(self, AckPayload::Published { reason_code } if *reason_code >= 0x80)
    }

    /// The packet type this payload acknowledges.
    pub fn answers(&self) -> Option<PacketType> {
        match self {
            AckPayload::Queued => None,
            AckPayload::Published { .. } => Some(PacketType::Publish),
            AckPayload::Subscribed { .. } => Some(PacketType::Subscribe),
            AckPayload::Unsubscribed { .. } => Some(PacketType::Unsubscribe),
        }
    }
}

/// A packet admitted to the identifier store.
#[derive(Debug)]
pub struct Allocation {
    pub id: u16,
    /// The stored instance. Only this instance is accepted by
    /// [`IdentifierStore::mark_sent`].
    pub packet: SharedPacket,
    pub ack: AckFuture,
}

/// Completion handle of an allocated packet.
///
/// Resolves with the ack payload, or fails with [`Error::PoisonousPacket`],
/// [`Error::Cancelled`] or [`Error::SessionReset`].
#[derive(Debug)]
pub struct AckFuture {
    rx: oneshot::Receiver<Result<AckPayload>>,
}

impl AckFuture {
    /// A future that is already resolved.
    pub fn ready(result: Result<AckPayload>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for AckFuture {
    type Output = Result<AckPayload>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::Cancelled)))
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Where an entry is in its acknowledgement flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a single ack (PUBACK, SUBACK, UNSUBACK).
    Qos1,
    /// QoS 2 PUBLISH waiting for PUBREC.
    Qos2Pending,
    /// PUBREC received; PUBREL stored and waiting for PUBCOMP.
    Qos2Released,
}

/// Delivery status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Active,
    /// Proven lost by a later ack; resend immediately.
    Dropped,
    /// Acked while written more than once; kept until proven dead.
    UncertainDead,
}

/// Which acknowledgement is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStage {
    /// PUBACK, SUBACK or UNSUBACK.
    Single,
    /// PUBREC, the intermediate ack of a QoS 2 flow.
    Received,
    /// PUBCOMP.
    Completed,
}

impl AckStage {
    pub fn is_intermediate(self) -> bool {
        self == AckStage::Received
    }
}

/// Result of [`IdentifierStore::ack`].
#[derive(Debug)]
pub enum AckOutcome {
    /// The ack was applied; the caller's future is resolved.
    Completed,
    /// PUBREC applied; the returned PUBREL must be sent.
    Release(SharedPacket),
    /// Repeated PUBREC for an entry already released.
    Duplicate,
    /// No sent entry matches this ack.
    Unknown,
}

/// Result of [`IdentifierStore::get_oldest_due_for_resend`].
#[derive(Debug)]
pub enum ResendScan {
    /// This packet is due and must be written again.
    Due(SharedPacket),
    /// Nothing due; the next entry falls due after this long, if any is sent.
    Idle(Option<Duration>),
}

/// Read-only view of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryState {
    pub phase: Phase,
    pub status: Status,
    pub attempt: u16,
    pub sent: bool,
}

struct InFlight {
    packet: SharedPacket,
    origin: PacketType,
    phase: Phase,
    status: Status,
    attempt: u16,
    emitted_at: Option<Duration>,
    ack: Option<oneshot::Sender<Result<AckPayload>>>,
}

impl InFlight {
    fn resolve(&mut self, result: Result<AckPayload>) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(result);
        }
    }
}

#[derive(Default)]
struct Slot {
    entry: Option<InFlight>,
    next_free: u16,
    older: u16,
    newer: u16,
}

// ============================================================================
// Table
// ============================================================================

struct IdTable {
    slots: Vec<Slot>,
    free_head: u16,
    oldest: u16,
    newest: u16,
    live: usize,
    capacity: usize,
}

impl IdTable {
    fn new(initial: usize, capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u16::MAX as usize);
        let mut table = Self {
            slots: Vec::new(),
            free_head: NONE,
            oldest: NONE,
            newest: NONE,
            live: 0,
            capacity,
        };
        table.grow_to(initial.clamp(1, capacity));
        table
    }

    /// Extend the table to `len` slots, putting new ids on the free list
    /// lowest first.
    fn grow_to(&mut self, len: usize) {
        let start = self.slots.len();
        if len <= start {
            return;
        }
        self.slots.resize_with(len, Slot::default);
        let mut next = self.free_head;
        for idx in (start..len).rev() {
            self.slots[idx].next_free = next;
            next = (idx + 1) as u16;
        }
        self.free_head = next;
    }

    fn alloc_id(&mut self) -> Option<u16> {
        if self.free_head == NONE {
            let len = self.slots.len();
            if len >= self.capacity {
                return None;
            }
            self.grow_to((len * 2).min(self.capacity));
        }
        let id = self.free_head;
        self.free_head = self.slot(id).next_free;
        Some(id)
    }

    fn slot(&self, id: u16) -> &Slot {
        &self.slots[id as usize - 1]
    }

    fn slot_mut(&mut self, id: u16) -> &mut Slot {
        &mut self.slots[id as usize - 1]
    }

    fn get(&self, id: u16) -> Option<&InFlight> {
        if id == NONE {
            return None;
        }
        self.slots.get(id as usize - 1)?.entry.as_ref()
    }

    fn get_mut(&mut self, id: u16) -> Option<&mut InFlight> {
        if id == NONE {
            return None;
        }
        self.slots.get_mut(id as usize - 1)?.entry.as_mut()
    }

    /// Store `entry` under a freshly allocated id, as the newest entry.
    fn insert(&mut self, id: u16, entry: InFlight) {
        let newest = self.newest;
        {
            let slot = self.slot_mut(id);
            slot.entry = Some(entry);
            slot.next_free = NONE;
            slot.older = newest;
            slot.newer = NONE;
        }
        if newest == NONE {
            self.oldest = id;
        } else {
            self.slot_mut(newest).newer = id;
        }
        self.newest = id;
        self.live += 1;
    }

    /// Remove the entry and return its id to the free list.
    fn remove(&mut self, id: u16) -> Option<InFlight> {
        let (entry, older, newer) = {
            let slot = self.slots.get_mut(id.checked_sub(1)? as usize)?;
            let entry = slot.entry.take()?;
            (entry, slot.older, slot.newer)
        };
        if older == NONE {
            self.oldest = newer;
        } else {
            self.slot_mut(older).newer = newer;
        }
        if newer == NONE {
            self.newest = older;
        } else {
            self.slot_mut(newer).older = older;
        }
        let free_head = self.free_head;
        let slot = self.slot_mut(id);
        slot.older = NONE;
        slot.newer = NONE;
        slot.next_free = free_head;
        self.free_head = id;
        self.live -= 1;
        Some(entry)
    }

    fn take_all(&mut self) -> Vec<InFlight> {
        self.slots.drain(..).filter_map(|s| s.entry).collect()
    }
}

// ============================================================================
// Store
// ============================================================================

/// Identifier store shared by the pumps, the reflexes and the client API.
pub struct IdentifierStore {
    table: Mutex<IdTable>,
    freed: Notify,
    dropped: Notify,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn Sink>,
    initial_size: usize,
    max_resends: u16,
    retry_interval: Duration,
}

impl IdentifierStore {
    /// Create an empty store sized from the client configuration.
    pub fn new(config: &ClientConfig, clock: Arc<dyn Clock>, sink: Arc<dyn Sink>) -> Self {
        let initial_size = config.initial_id_table_size as usize;
        Self {
            table: Mutex::new(IdTable::new(initial_size, config.max_inflight as usize)),
            freed: Notify::new(),
            dropped: Notify::new(),
            clock,
            sink,
            initial_size,
            max_resends: config.max_resends,
            retry_interval: config.store_retry_interval,
        }
    }

    /// Number of live identifiers.
    pub fn len(&self) -> usize {
        self.table.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of live identifiers.
    pub fn capacity(&self) -> usize {
        self.table.lock().capacity
    }

    /// Snapshot of the entry for `id`, if live.
    pub fn entry_state(&self, id: u16) -> Option<EntryState> {
        self.table.lock().get(id).map(|e| EntryState {
            phase: e.phase,
            status: e.status,
            attempt: e.attempt,
            sent: e.emitted_at.is_some(),
        })
    }

    /// Assign an identifier to `packet` and store it.
    ///
    /// Suspends while the table is full. Waiters wake on every freed
    /// identifier and retry every `store_retry_interval`; there is no
    /// ordering among waiters.
    pub async fn allocate(&self, mut packet: Box<dyn OutgoingPacket>) -> Result<Allocation> {
        if packet.is_remote_owned() || packet.qos() == QoS::AtMostOnce {
            return Err(Error::Internal(format!(
                "{:?} packet is not tracked by the identifier store",
                packet.packet_type()
            )));
        }

        let mut report = true;
        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            let (live, capacity) = {
                let mut table = self.table.lock();
                if let Some(id) = table.alloc_id() {
                    packet.set_packet_id(id);
                    let origin = packet.packet_type();
                    let phase = if origin == PacketType::Publish && packet.qos() == QoS::ExactlyOnce {
                        Phase::Qos2Pending
                    } else {
                        Phase::Qos1
                    };
                    let (tx, rx) = oneshot::channel();
                    let shared: SharedPacket = Arc::from(packet);
                    table.insert(
                        id,
                        InFlight {
                            packet: shared.clone(),
                            origin,
                            phase,
                            status: Status::Active,
                            attempt: 0,
                            emitted_at: None,
                            ack: Some(tx),
                        },
                    );
                    trace!("allocated packet id {}", id);
                    return Ok(Allocation {
                        id,
                        packet: shared,
                        ack: AckFuture { rx },
                    });
                }
                (table.live, table.capacity)
            };

            if report {
                debug!("identifier store full ({}/{}), waiting", live, capacity);
                self.sink.on_event(SinkEvent::StoreFilling { live, capacity });
                report = false;
            }

            tokio::select! {
                _ = &mut freed => {}
                _ = self.clock.sleep(self.retry_interval) => report = true,
            }
        }
    }

    /// Record a transmission of `packet` under `id` and return the new
    /// write count.
    ///
    /// Must be called before the bytes are written. Returns `None` when the
    /// entry no longer holds this packet (acked, reset or swapped for a
    /// PUBREL) or was acked since the resend scan picked it, in which case
    /// the packet must not be written.
    pub fn mark_sent(&self, id: u16, packet: &SharedPacket) -> Option<u16> {
        let now = self.clock.now();
        let mut table = self.table.lock();
        let entry = table
            .get_mut(id)
            .filter(|e| same_packet(&e.packet, packet) && e.status != Status::UncertainDead)?;
        entry.attempt = entry.attempt.saturating_add(1);
        entry.emitted_at = Some(now);
        if entry.status == Status::Dropped {
            entry.status = Status::Active;
        }
        Some(entry.attempt)
    }

    /// Apply an acknowledgement for `id`.
    ///
    /// Never fails: acks that match no sent entry, or that arrive at the
    /// wrong stage, come back as [`AckOutcome::Unknown`] for the caller to
    /// treat as a protocol violation.
    pub fn ack(&self, id: u16, payload: AckPayload, stage: AckStage) -> AckOutcome {
        let mut resolved = None;
        let mut freed_any = false;
        let mut dropped_any = false;

        let outcome = {
            let mut table = self.table.lock();
            let Some(entry) = table.get(id) else {
                return AckOutcome::Unknown;
            };
            if payload.answers() != Some(entry.origin) {
                return AckOutcome::Unknown;
            }
            let expected = match (stage, entry.phase) {
                (AckStage::Single, Phase::Qos1) => true,
                (AckStage::Received, Phase::Qos2Pending) => true,
                (AckStage::Received, Phase::Qos2Released) => return AckOutcome::Duplicate,
                (AckStage::Completed, Phase::Qos2Released) => true,
                _ => false,
            };
            let Some(emitted_at) = entry.emitted_at.filter(|_| expected) else {
                return AckOutcome::Unknown;
            };

            // Older entries written before this one can no longer be acked.
            let mut cursor = table.slot(id).older;
            while cursor != NONE {
                let older = table.slot(cursor).older;
                let status = table
                    .get(cursor)
                    .filter(|q| q.emitted_at.is_some_and(|t| t < emitted_at))
                    .map(|q| q.status);
                match status {
                    Some(Status::UncertainDead) => {
                        table.remove(cursor);
                        freed_any = true;
                    }
                    Some(Status::Active) => {
                        if let Some(q) = table.get_mut(cursor) {
                            q.status = Status::Dropped;
                        }
                        trace!("packet id {} dropped by ack for {}", cursor, id);
                        dropped_any = true;
                    }
                    _ => {}
                }
                cursor = older;
            }

            let Some(entry) = table.get_mut(id) else {
                return AckOutcome::Unknown;
            };
            // A v5 PUBREC with a failure code ends the flow; no PUBREL follows.
            let released = stage == AckStage::Received
                && !payload.is_failure()
                && entry.status != Status::UncertainDead;
            if released {
                let release: SharedPacket = Arc::new(Ack::new(AckKind::PubRel, id));
                entry.packet = release.clone();
                entry.phase = Phase::Qos2Released;
                entry.status = Status::Active;
                entry.attempt = 0;
                entry.emitted_at = None;
                AckOutcome::Release(release)
            } else if entry.attempt <= 1 {
                if let Some(mut entry) = table.remove(id) {
                    resolved = entry.ack.take();
                }
                freed_any = true;
                AckOutcome::Completed
            } else {
                entry.attempt -= 1;
                entry.status = Status::UncertainDead;
                resolved = entry.ack.take();
                trace!("packet id {} acked after {} writes, uncertain", id, entry.attempt + 1);
                AckOutcome::Completed
            }
        };

        if let Some(tx) = resolved {
            let _ = tx.send(Ok(payload));
        }
        if freed_any {
            self.freed.notify_waiters();
        }
        if dropped_any {
            self.dropped.notify_one();
        }
        outcome
    }

    /// Find the oldest sent entry whose ack wait has elapsed.
    ///
    /// Scans in allocation order. Dropped entries are due at once. Due
    /// uncertain entries are freed; due entries past the resend budget are
    /// freed and failed with [`Error::PoisonousPacket`].
    pub fn get_oldest_due_for_resend(&self, threshold: Duration) -> ResendScan {
        let now = self.clock.now();
        let mut poisoned = Vec::new();
        let mut freed_any = false;
        let mut next_due: Option<Duration> = None;
        let mut due = None;

        {
            let mut table = self.table.lock();
            let mut cursor = table.oldest;
            while cursor != NONE {
                let newer = table.slot(cursor).newer;
                let Some(entry) = table.get(cursor) else {
                    break;
                };
                let Some(emitted_at) = entry.emitted_at else {
                    cursor = newer;
                    continue;
                };
                let elapsed = now.saturating_sub(emitted_at);
                if entry.status != Status::Dropped && elapsed < threshold {
                    let wait = threshold - elapsed;
                    next_due = Some(next_due.map_or(wait, |w| w.min(wait)));
                    cursor = newer;
                    continue;
                }

                if entry.status == Status::UncertainDead {
                    trace!("uncertain packet id {} timed out, freeing", cursor);
                    table.remove(cursor);
                    freed_any = true;
                } else if entry.attempt > self.max_resends {
                    let attempts = entry.attempt;
                    if let Some(entry) = table.remove(cursor) {
                        poisoned.push((cursor, attempts, entry));
                    }
                    freed_any = true;
                } else {
                    due = Some(entry.packet.clone());
                    break;
                }
                cursor = newer;
            }
        }

        for (packet_id, attempts, mut entry) in poisoned {
            warn!("packet id {} unacknowledged after {} attempts, dropping", packet_id, attempts);
            entry.resolve(Err(Error::PoisonousPacket { packet_id, attempts }));
            self.sink.on_event(SinkEvent::PoisonousPacket { packet_id, attempts });
        }
        if freed_any {
            self.freed.notify_waiters();
        }

        match due {
            Some(packet) => ResendScan::Due(packet),
            None => ResendScan::Idle(next_due),
        }
    }

    /// Wait until an ack marks an entry dropped.
    pub async fn dropped(&self) {
        self.dropped.notified().await
    }

    /// Discard every entry and fail every pending future with
    /// [`Error::SessionReset`].
    pub fn reset(&self) {
        let entries = {
            let mut table = self.table.lock();
            let capacity = table.capacity;
            let entries = table.take_all();
            *table = IdTable::new(self.initial_size, capacity);
            entries
        };
        if !entries.is_empty() {
            debug!("identifier store reset, discarding {} entries", entries.len());
        }
        for mut entry in entries {
            entry.resolve(Err(Error::SessionReset));
        }
        self.freed.notify_waiters();
    }

    /// Fail every pending future with [`Error::Cancelled`], keeping the
    /// identifiers reserved.
    pub fn cancel_all(&self) {
        let mut cancelled = Vec::new();
        {
            let mut table = self.table.lock();
            let mut cursor = table.oldest;
            while cursor != NONE {
                let newer = table.slot(cursor).newer;
                if let Some(tx) = table.get_mut(cursor).and_then(|e| e.ack.take()) {
                    cancelled.push(tx);
                }
                cursor = newer;
            }
        }
        if !cancelled.is_empty() {
            debug!("cancelling {} pending acks", cancelled.len());
        }
        for tx in cancelled {
            let _ = tx.send(Err(Error::Cancelled));
        }
    }

    /// Prepare a resumed session: free uncertain entries, reset the write
    /// counts of the rest and return every previously written packet in
    /// allocation order.
    pub fn prepare_replay(&self) -> Vec<SharedPacket> {
        let mut replay = Vec::new();
        let mut freed_any = false;
        {
            let mut table = self.table.lock();
            let mut cursor = table.oldest;
            while cursor != NONE {
                let newer = table.slot(cursor).newer;
                if let Some(entry) = table.get_mut(cursor) {
                    if entry.status == Status::UncertainDead {
                        table.remove(cursor);
                        freed_any = true;
                    } else if entry.emitted_at.is_some() {
                        entry.attempt = 0;
                        entry.emitted_at = None;
                        entry.status = Status::Active;
                        replay.push(entry.packet.clone());
                    }
                }
                cursor = newer;
            }
        }
        if freed_any {
            self.freed.notify_waiters();
        }
        replay
    }
}

impl std::fmt::Debug for IdentifierStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("IdentifierStore")
            .field("live", &table.live)
            .field("capacity", &table.capacity)
            .field("max_resends", &self.max_resends)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::packet::{Publish, Subscribe};
    use crate::sink::{ChannelSink, Notification};
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Fixture {
        store: Arc<IdentifierStore>,
        clock: Arc<ManualClock>,
        events: mpsc::Receiver<Notification>,
    }

    fn fixture(config: ClientConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let (sink, events) = ChannelSink::new(64);
        let store = Arc::new(IdentifierStore::new(&config, clock.clone(), Arc::new(sink)));
        Fixture { store, clock, events }
    }

    fn publish(qos: QoS) -> Box<dyn OutgoingPacket> {
        Box::new(Publish::new("t", &b"payload"[..], qos))
    }

    fn published() -> AckPayload {
        AckPayload::Published { reason_code: 0 }
    }

    async fn allocate_sent(store: &IdentifierStore, qos: QoS) -> (u16, AckFuture, SharedPacket) {
        let Allocation { id, packet, ack: fut } = store.allocate(publish(qos)).await.unwrap();
        assert_eq!(store.mark_sent(id, &packet), Some(1));
        (id, fut, packet)
    }

    fn poll_now(fut: &mut AckFuture) -> Option<Result<AckPayload>> {
        match tokio_test::task::spawn(fut).poll() {
            Poll::Ready(r) => Some(r),
            Poll::Pending => None,
        }
    }

    #[tokio::test]
    async fn test_qos1_round_trip() {
        let f = fixture(ClientConfig::new("t"));
        for expected in 1..=4 {
            let (id, _fut, _) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
            assert_eq!(id, expected);
        }
        let (id, fut, _) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        assert_eq!(id, 5);
        assert_eq!(f.store.entry_state(5).unwrap().attempt, 1);

        let payload = AckPayload::Published { reason_code: 0x10 };
        assert!(matches!(f.store.ack(5, payload.clone(), AckStage::Single), AckOutcome::Completed));
        assert_eq!(fut.await.unwrap(), payload);
        assert!(f.store.entry_state(5).is_none());
        assert_eq!(f.store.len(), 4);
    }

    #[tokio::test]
    async fn test_ack_for_unknown_id() {
        let f = fixture(ClientConfig::new("t"));
        assert!(matches!(f.store.ack(1, published(), AckStage::Single), AckOutcome::Unknown));
        assert!(matches!(f.store.ack(0, published(), AckStage::Single), AckOutcome::Unknown));
        assert!(matches!(f.store.ack(65535, published(), AckStage::Single), AckOutcome::Unknown));

        // allocated but never written
        let Allocation { id, ack: _fut, .. } = f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap();
        assert!(matches!(f.store.ack(id, published(), AckStage::Single), AckOutcome::Unknown));
        assert!(f.store.entry_state(id).is_some());
    }

    #[tokio::test]
    async fn test_ack_at_wrong_stage() {
        let f = fixture(ClientConfig::new("t"));
        let (q1, _f1, _) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        let (q2, _f2, _) = allocate_sent(&f.store, QoS::ExactlyOnce).await;

        assert!(matches!(f.store.ack(q1, published(), AckStage::Received), AckOutcome::Unknown));
        assert!(matches!(f.store.ack(q2, published(), AckStage::Single), AckOutcome::Unknown));
        assert!(matches!(f.store.ack(q2, published(), AckStage::Completed), AckOutcome::Unknown));
        let suback = AckPayload::Subscribed { return_codes: vec![0] };
        assert!(matches!(f.store.ack(q1, suback, AckStage::Single), AckOutcome::Unknown));
    }

    #[tokio::test]
    async fn test_qos2_two_phase() {
        let f = fixture(ClientConfig::new("t"));
        let (id, mut fut, publish) = allocate_sent(&f.store, QoS::ExactlyOnce).await;

        let release = match f.store.ack(id, published(), AckStage::Received) {
            AckOutcome::Release(p) => p,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(release.packet_type(), PacketType::PubRel);
        assert_eq!(release.packet_id(), id);
        let state = f.store.entry_state(id).unwrap();
        assert_eq!(state.phase, Phase::Qos2Released);
        assert_eq!(state.attempt, 0);
        assert!(poll_now(&mut fut).is_none());

        // repeated PUBREC is idempotent
        assert!(matches!(f.store.ack(id, published(), AckStage::Received), AckOutcome::Duplicate));
        // the stale PUBLISH may no longer be written
        assert!(f.store.mark_sent(id, &publish).is_none());

        assert_eq!(f.store.mark_sent(id, &release), Some(1));
        assert!(matches!(f.store.ack(id, published(), AckStage::Completed), AckOutcome::Completed));
        assert_eq!(fut.await.unwrap(), published());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_ack_after_resend_is_uncertain() {
        let f = fixture(ClientConfig::new("t"));
        let (id, fut, packet) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.store.mark_sent(id, &packet), Some(2));
        assert_eq!(f.store.entry_state(id).unwrap().attempt, 2);

        assert!(matches!(f.store.ack(id, published(), AckStage::Single), AckOutcome::Completed));
        // caller resolved, id still reserved
        assert_eq!(fut.await.unwrap(), published());
        let state = f.store.entry_state(id).unwrap();
        assert_eq!(state.status, Status::UncertainDead);
        assert_eq!(state.attempt, 1);

        // the second ack settles it
        assert!(matches!(f.store.ack(id, published(), AckStage::Single), AckOutcome::Completed));
        assert!(f.store.entry_state(id).is_none());
    }

    #[tokio::test]
    async fn test_uncertain_freed_by_timeout() {
        let f = fixture(ClientConfig::new("t"));
        let (id, _fut, packet) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        f.clock.advance(Duration::from_secs(1));
        f.store.mark_sent(id, &packet);
        f.store.ack(id, published(), AckStage::Single);
        assert_eq!(f.store.entry_state(id).unwrap().status, Status::UncertainDead);

        assert!(matches!(
            f.store.get_oldest_due_for_resend(TIMEOUT),
            ResendScan::Idle(Some(w)) if w == TIMEOUT
        ));
        f.clock.advance(TIMEOUT);
        assert!(matches!(f.store.get_oldest_due_for_resend(TIMEOUT), ResendScan::Idle(None)));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_uncertain_freed_by_later_ack() {
        let f = fixture(ClientConfig::new("t"));
        let (a, _fa, packet_a) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        f.clock.advance(Duration::from_secs(1));
        f.store.mark_sent(a, &packet_a);
        f.store.ack(a, published(), AckStage::Single);
        assert_eq!(f.store.entry_state(a).unwrap().status, Status::UncertainDead);

        f.clock.advance(Duration::from_secs(1));
        let (b, fb, _) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        f.store.ack(b, published(), AckStage::Single);
        assert!(fb.await.is_ok());
        assert!(f.store.entry_state(a).is_none());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_acked_while_due_is_not_rewritten() {
        let f = fixture(ClientConfig::new("t"));
        let (id, fut, packet) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        f.clock.advance(TIMEOUT);
        let ResendScan::Due(due) = f.store.get_oldest_due_for_resend(TIMEOUT) else {
            panic!("expected a due entry");
        };
        assert_eq!(f.store.mark_sent(id, &due), Some(2));

        // picked for a second resend, then the ack lands before the write
        f.clock.advance(TIMEOUT);
        let ResendScan::Due(due) = f.store.get_oldest_due_for_resend(TIMEOUT) else {
            panic!("expected a due entry");
        };
        assert!(same_packet(&due, &packet));
        assert!(matches!(f.store.ack(id, published(), AckStage::Single), AckOutcome::Completed));
        assert_eq!(fut.await.unwrap(), published());

        let before = f.store.entry_state(id).unwrap();
        assert_eq!(before.status, Status::UncertainDead);
        assert!(f.store.mark_sent(id, &due).is_none());
        assert_eq!(f.store.entry_state(id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_pubrec_ends_flow() {
        let f = fixture(ClientConfig::new("t"));
        let (id, fut, publish) = allocate_sent(&f.store, QoS::ExactlyOnce).await;

        let refused = AckPayload::Published { reason_code: 0x87 };
        assert!(matches!(f.store.ack(id, refused.clone(), AckStage::Received), AckOutcome::Completed));
        assert_eq!(fut.await.unwrap(), refused);
        assert!(f.store.mark_sent(id, &publish).is_none());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_older_entry_dropped_by_newer_ack() {
        let mut f = fixture(ClientConfig::new("t"));
        let Allocation { id: id1, packet: p1, ack: mut fut1 } =
            f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap();
        let Allocation { id: id2, packet: p2, ack: _fut2 } =
            f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap();

        f.store.mark_sent(id1, &p1);
        f.clock.advance(Duration::from_secs(1));
        f.store.mark_sent(id1, &p1);
        assert_eq!(f.store.entry_state(id1).unwrap().attempt, 2);
        f.clock.advance(Duration::from_secs(1));
        f.store.mark_sent(id2, &p2);

        assert!(matches!(f.store.ack(id2, published(), AckStage::Single), AckOutcome::Completed));
        let state = f.store.entry_state(id1).unwrap();
        assert_eq!(state.status, Status::Dropped);
        assert!(poll_now(&mut fut1).is_none());

        // dropped entries are due immediately, without waiting for the timeout
        tokio::time::timeout(Duration::from_secs(1), f.store.dropped()).await.unwrap();
        match f.store.get_oldest_due_for_resend(TIMEOUT) {
            ResendScan::Due(p) => assert!(same_packet(&p, &p1)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.store.mark_sent(id1, &p1), Some(3));
        assert_eq!(f.store.entry_state(id1).unwrap().status, Status::Active);
        assert_eq!(f.store.entry_state(id1).unwrap().attempt, 3);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_newer_write_not_dropped() {
        let f = fixture(ClientConfig::new("t"));
        let (id1, _f1, p1) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        f.clock.advance(Duration::from_secs(1));
        let (id2, _f2, _) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        f.clock.advance(Duration::from_secs(1));
        // id1 rewritten after id2: an ack for id2 proves nothing about it
        f.store.mark_sent(id1, &p1);
        f.store.ack(id2, published(), AckStage::Single);
        assert_eq!(f.store.entry_state(id1).unwrap().status, Status::Active);
    }

    #[tokio::test]
    async fn test_resend_waits_for_timeout() {
        let f = fixture(ClientConfig::new("t"));
        let (_, _fut, packet) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        // never-written entries are not scanned
        f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap();

        f.clock.advance(Duration::from_secs(4));
        assert!(matches!(
            f.store.get_oldest_due_for_resend(TIMEOUT),
            ResendScan::Idle(Some(w)) if w == Duration::from_secs(6)
        ));
        f.clock.advance(Duration::from_millis(5999));
        assert!(matches!(f.store.get_oldest_due_for_resend(TIMEOUT), ResendScan::Idle(Some(_))));
        f.clock.advance(Duration::from_millis(1));
        assert!(matches!(
            f.store.get_oldest_due_for_resend(TIMEOUT),
            ResendScan::Due(p) if same_packet(&p, &packet)
        ));
    }

    #[tokio::test]
    async fn test_resend_scan_follows_allocation_order() {
        let f = fixture(ClientConfig::new("t"));
        let Allocation { id: id1, packet: p1, ack: _f1 } =
            f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap();
        let Allocation { id: id2, packet: p2, ack: _f2 } =
            f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap();
        // written in reverse order
        f.store.mark_sent(id2, &p2);
        f.store.mark_sent(id1, &p1);
        f.clock.advance(TIMEOUT);

        match f.store.get_oldest_due_for_resend(TIMEOUT) {
            ResendScan::Due(p) => assert_eq!(p.packet_id(), id1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poisonous_packet() {
        let mut f = fixture(ClientConfig::new("t").with_max_resends(2));
        let (id, fut, packet) = allocate_sent(&f.store, QoS::AtLeastOnce).await;

        for attempt in 2..=3 {
            f.clock.advance(TIMEOUT);
            assert!(matches!(f.store.get_oldest_due_for_resend(TIMEOUT), ResendScan::Due(_)));
            f.store.mark_sent(id, &packet);
            assert_eq!(f.store.entry_state(id).unwrap().attempt, attempt);
        }

        f.clock.advance(TIMEOUT);
        assert!(matches!(f.store.get_oldest_due_for_resend(TIMEOUT), ResendScan::Idle(None)));
        assert!(f.store.entry_state(id).is_none());
        assert!(matches!(
            fut.await,
            Err(Error::PoisonousPacket { packet_id, attempts: 3 }) if packet_id == id
        ));
        assert_eq!(
            f.events.recv().await,
            Some(Notification::Event(SinkEvent::PoisonousPacket { packet_id: id, attempts: 3 }))
        );

        // reported once
        f.clock.advance(TIMEOUT);
        f.store.get_oldest_due_for_resend(TIMEOUT);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_table_suspends_allocate() {
        let mut f = fixture(ClientConfig::new("t").with_max_inflight(3).with_initial_id_table_size(1));
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(allocate_sent(&f.store, QoS::AtLeastOnce).await);
        }
        assert_eq!(f.store.len(), 3);

        let store = f.store.clone();
        let waiter = tokio::spawn(async move { store.allocate(publish(QoS::AtLeastOnce)).await });
        assert!(matches!(
            f.events.recv().await,
            Some(Notification::Event(SinkEvent::StoreFilling { live: 3, capacity: 3 }))
        ));
        assert!(!waiter.is_finished());

        f.store.ack(2, published(), AckStage::Single);
        let allocation = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(allocation.id, 2);
        assert_eq!(f.store.len(), 3);
    }

    #[tokio::test]
    async fn test_poison_frees_id_for_waiting_allocate() {
        let f = fixture(
            ClientConfig::new("t")
                .with_max_inflight(1)
                .with_max_resends(0),
        );
        let (id, fut, _) = allocate_sent(&f.store, QoS::AtLeastOnce).await;

        let store = f.store.clone();
        let waiter = tokio::spawn(async move { store.allocate(publish(QoS::ExactlyOnce)).await });
        tokio::task::yield_now().await;

        f.clock.advance(TIMEOUT);
        assert!(matches!(f.store.get_oldest_due_for_resend(TIMEOUT), ResendScan::Idle(None)));
        assert!(matches!(fut.await, Err(Error::PoisonousPacket { .. })));

        let allocation = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(allocation.id, id);
        assert_eq!(f.store.entry_state(id).unwrap().phase, Phase::Qos2Pending);
    }

    #[tokio::test]
    async fn test_table_grows_to_capacity() {
        let f = fixture(ClientConfig::new("t").with_initial_id_table_size(2).with_max_inflight(5));
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap());
        }
        let ids: Vec<u16> = ids.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(f.store.len(), 5);
        assert_eq!(f.store.table.lock().slots.len(), 5);
    }

    #[tokio::test]
    async fn test_freed_ids_reused_lifo() {
        let f = fixture(ClientConfig::new("t"));
        for _ in 0..3 {
            allocate_sent(&f.store, QoS::AtLeastOnce).await;
        }
        f.store.ack(1, published(), AckStage::Single);
        f.store.ack(3, published(), AckStage::Single);
        let Allocation { id: a, .. } = f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap();
        let Allocation { id: b, .. } = f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap();
        assert_eq!((a, b), (3, 1));
    }

    #[tokio::test]
    async fn test_reset_fails_futures_and_frees_ids() {
        let f = fixture(ClientConfig::new("t"));
        let (_, fut1, _) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        let Allocation { ack: fut2, .. } = f.store.allocate(publish(QoS::ExactlyOnce)).await.unwrap();
        f.store.reset();

        assert!(matches!(fut1.await, Err(Error::SessionReset)));
        assert!(matches!(fut2.await, Err(Error::SessionReset)));
        assert!(f.store.is_empty());
        let Allocation { id, .. } = f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn test_cancel_all_keeps_ids() {
        let f = fixture(ClientConfig::new("t"));
        let (id, fut, _) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        f.store.cancel_all();
        assert!(matches!(fut.await, Err(Error::Cancelled)));
        assert!(f.store.entry_state(id).is_some());
        // a late ack still frees the id
        assert!(matches!(f.store.ack(id, published(), AckStage::Single), AckOutcome::Completed));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_replay() {
        let f = fixture(ClientConfig::new("t"));
        let (a, _fa, pa) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
        let (b, _fb, _) = allocate_sent(&f.store, QoS::ExactlyOnce).await;
        let Allocation { id: _c, ack: _fc, .. } = f.store.allocate(publish(QoS::AtLeastOnce)).await.unwrap();
        let (d, _fd, pd) = allocate_sent(&f.store, QoS::AtLeastOnce).await;

        // a is uncertain, b released, c never written
        f.clock.advance(Duration::from_secs(1));
        f.store.mark_sent(a, &pa);
        f.store.mark_sent(d, &pd);
        f.store.ack(a, published(), AckStage::Single);
        let release = match f.store.ack(b, published(), AckStage::Received) {
            AckOutcome::Release(p) => p,
            other => panic!("unexpected {other:?}"),
        };
        f.store.mark_sent(b, &release);

        let replay = f.store.prepare_replay();
        let ids: Vec<(u16, PacketType)> = replay.iter().map(|p| (p.packet_id(), p.packet_type())).collect();
        assert_eq!(ids, vec![(b, PacketType::PubRel), (d, PacketType::Publish)]);
        assert!(f.store.entry_state(a).is_none());
        assert_eq!(f.store.entry_state(d).unwrap().attempt, 0);
        assert!(!f.store.entry_state(d).unwrap().sent);
    }

    #[tokio::test]
    async fn test_subscribe_ack() {
        let f = fixture(ClientConfig::new("t"));
        let subscribe = Subscribe { packet_id: 0, filters: vec![("a/#".into(), QoS::AtLeastOnce)] };
        let Allocation { id, packet, ack: fut } = f.store.allocate(Box::new(subscribe)).await.unwrap();
        assert_eq!(packet.packet_id(), id);
        f.store.mark_sent(id, &packet);

        let codes = AckPayload::Subscribed { return_codes: vec![1] };
        assert!(matches!(f.store.ack(id, published(), AckStage::Single), AckOutcome::Unknown));
        assert!(matches!(f.store.ack(id, codes.clone(), AckStage::Single), AckOutcome::Completed));
        assert_eq!(fut.await.unwrap(), codes);
    }

    #[tokio::test]
    async fn test_untracked_packets_rejected() {
        let f = fixture(ClientConfig::new("t"));
        assert!(f.store.allocate(publish(QoS::AtMostOnce)).await.is_err());
        assert!(f.store.allocate(Box::new(Ack::new(AckKind::PubAck, 3))).await.is_err());
    }

    #[tokio::test]
    async fn test_ids_unique_under_churn() {
        let f = fixture(ClientConfig::new("t").with_max_inflight(16).with_initial_id_table_size(4));
        let mut live = std::collections::HashSet::new();
        let mut order = std::collections::VecDeque::new();
        for round in 0..200u32 {
            if live.len() < 16 && round % 3 != 2 {
                let (id, _, _) = allocate_sent(&f.store, QoS::AtLeastOnce).await;
                assert!(live.insert(id), "id {id} handed out twice");
                order.push_back(id);
            } else if let Some(id) = order.pop_front() {
                // acks in send order keep every entry certain
                assert!(matches!(f.store.ack(id, published(), AckStage::Single), AckOutcome::Completed));
                live.remove(&id);
            }
            if round % 50 == 49 {
                f.store.reset();
                live.clear();
                order.clear();
            }
            assert_eq!(f.store.len(), live.len());
        }
    }

    #[test]
    fn test_ready_future() {
        let mut fut = AckFuture::ready(Ok(AckPayload::Queued));
        assert_eq!(poll_now(&mut fut).unwrap().unwrap(), AckPayload::Queued);
    }
}
