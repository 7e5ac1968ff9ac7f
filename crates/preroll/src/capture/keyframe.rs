//! Offsets of keyframe starts inside the byte ring
//!
//! Entries are kept oldest first. Before any write lands in the ring, every
//! entry whose offset the write would cover is dropped, so the front entry
//! always points at a keyframe whose bytes are still intact.

use tracing::{debug, warn};

use super::buffer::RingBuffer;
use super::ring::SlotRing;

/// Default number of keyframe slots.
pub const DEFAULT_KEYFRAME_SLOTS: usize = 60_000;

pub struct KeyframeIndex {
    offsets: SlotRing<usize>,
    overflowed: u64,
}

impl KeyframeIndex {
    pub fn new(slots: usize) -> Self {
        Self {
            offsets: SlotRing::new(slots),
            overflowed: 0,
        }
    }

    /// Record a keyframe start. When all slots are used the oldest entry is
    /// dropped, which only shortens the pre-roll.
    pub fn push(&mut self, offset: usize) {
        if let Some(dropped) = self.offsets.push_overwrite(offset) {
            self.overflowed += 1;
            if self.overflowed == 1 {
                warn!(
                    slots = self.offsets.capacity(),
                    dropped, "Keyframe index full, dropping oldest entries"
                );
            }
        }
    }

    /// Oldest retained keyframe offset.
    pub fn oldest(&self) -> Option<usize> {
        self.offsets.front().copied()
    }

    /// Drop every entry the next `len` byte write into `ring` would overwrite.
    ///
    /// Returns the number of entries removed.
    pub fn evict_covered(&mut self, ring: &RingBuffer, len: usize) -> usize {
        let mut evicted = 0;
        while let Some(&offset) = self.offsets.front() {
            if !ring.will_overwrite(offset, len) {
                break;
            }
            self.offsets.pop();
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, remaining = self.offsets.len(), "Evicted keyframes");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Entries dropped because the slot array was full.
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.offsets.iter().copied()
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.overflowed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_only_covered_entries() {
        let mut ring = RingBuffer::new(100).unwrap();
        let mut index = KeyframeIndex::new(8);

        index.push(0);
        ring.append(&[0u8; 40]);
        index.push(40);
        ring.append(&[0u8; 40]);
        // Cursor at 80; a 30 byte write covers 80..100 and 0..10
        assert_eq!(index.evict_covered(&ring, 30), 1);
        assert_eq!(index.oldest(), Some(40));
    }

    #[test]
    fn stops_at_first_uncovered_entry() {
        let mut ring = RingBuffer::new(10).unwrap();
        let mut index = KeyframeIndex::new(4);
        ring.append(&[0u8; 2]);
        index.push(2);
        ring.append(&[0u8; 4]);
        index.push(6);
        ring.append(&[0u8; 2]);
        // Cursor at 8; 5 bytes cover 8, 9, 0, 1, 2
        assert_eq!(index.evict_covered(&ring, 5), 1);
        assert_eq!(index.offsets().collect::<Vec<_>>(), vec![6]);
    }

    #[test]
    fn write_of_full_capacity_evicts_everything() {
        let mut ring = RingBuffer::new(16).unwrap();
        let mut index = KeyframeIndex::new(4);
        index.push(0);
        ring.append(&[0u8; 4]);
        index.push(4);
        assert_eq!(index.evict_covered(&ring, 16), 2);
        assert!(index.is_empty());
    }

    #[test]
    fn slot_overflow_drops_oldest() {
        let mut index = KeyframeIndex::new(2);
        index.push(1);
        index.push(2);
        index.push(3);
        assert_eq!(index.offsets().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(index.overflowed(), 1);
    }
}
