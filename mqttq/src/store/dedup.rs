//! Remote dedup store.
//!
//! Tracks identifiers the peer assigned to incoming QoS 2 PUBLISH packets
//! between PUBLISH and PUBREL, so a retransmitted PUBLISH is acknowledged
//! again without being delivered twice.

use parking_lot::Mutex;

const WORDS: usize = 65536 / 64;

/// Bitmap of peer-owned identifiers awaiting PUBREL.
pub struct DedupStore {
    bits: Mutex<Box<[u64; WORDS]>>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self {
            bits: Mutex::new(Box::new([0; WORDS])),
        }
    }

    /// Record `id`. Returns true if it was not already held, i.e. the
    /// message must be delivered.
    pub fn begin(&self, id: u16) -> bool {
        let (word, mask) = locate(id);
        let mut bits = self.bits.lock();
        let fresh = bits[word] & mask == 0;
        bits[word] |= mask;
        fresh
    }

    /// Release `id` on PUBREL. Returns whether it was held.
    pub fn release(&self, id: u16) -> bool {
        let (word, mask) = locate(id);
        let mut bits = self.bits.lock();
        let held = bits[word] & mask != 0;
        bits[word] &= !mask;
        held
    }

    pub fn contains(&self, id: u16) -> bool {
        let (word, mask) = locate(id);
        self.bits.lock()[word] & mask != 0
    }

    /// Number of held identifiers.
    pub fn len(&self) -> usize {
        self.bits.lock().iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.lock().iter().all(|w| *w == 0)
    }

    /// Forget every identifier (clean session).
    pub fn reset(&self) {
        self.bits.lock().fill(0);
    }
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupStore").field("held", &self.len()).finish()
    }
}

fn locate(id: u16) -> (usize, u64) {
    (id as usize / 64, 1u64 << (id % 64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_release() {
        let store = DedupStore::new();
        assert!(store.begin(7));
        assert!(!store.begin(7));
        assert!(store.contains(7));
        assert_eq!(store.len(), 1);

        assert!(store.release(7));
        assert!(!store.release(7));
        assert!(store.begin(7));
    }

    #[test]
    fn test_edges_and_reset() {
        let store = DedupStore::new();
        for id in [1, 63, 64, 65535] {
            assert!(store.begin(id));
        }
        assert_eq!(store.len(), 4);
        assert!(!store.contains(2));
        store.reset();
        assert!(store.is_empty());
    }
}
