//! In-memory slot indices — live keys and reclaimable extents.
//!
//! Both structures live under the engine's stream lock; they are plain
//! ordered maps, not concurrent ones.  Reads of live *values* go through
//! the facade's concurrent map and never touch these.

use std::collections::{BTreeMap, BTreeSet};

use crate::slot::SlotRef;

/// Ordered mapping key → slot for every `Allocated` record.
///
/// Invariant: keys here match the facade's value map exactly while the
/// collection is open with persistence enabled.
#[derive(Debug)]
pub struct AllocatedIndex<K> {
    slots: BTreeMap<K, SlotRef>,
}

impl<K: Ord> AllocatedIndex<K> {
    pub fn new() -> Self {
        Self { slots: BTreeMap::new() }
    }

    pub fn insert(&mut self, key: K, slot: SlotRef) -> Option<SlotRef> {
        self.slots.insert(key, slot)
    }

    pub fn remove(&mut self, key: &K) -> Option<SlotRef> {
        self.slots.remove(key)
    }

    pub fn get(&self, key: &K) -> Option<SlotRef> {
        self.slots.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

impl<K: Ord> Default for AllocatedIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reclaimable slots, searchable by extent.
///
/// Lookup policy: the smallest `total_len` that still fits the request,
/// ties broken by lowest offset.  Never returns a slot shorter than the
/// target; both `insert` and `take` are O(log n).
#[derive(Debug, Default)]
pub struct FreeIndex {
    by_offset: BTreeMap<u64, u32>,
    // (total_len, offset) — range scans give length-then-offset order.
    by_len: BTreeSet<(u32, u64)>,
}

impl FreeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: SlotRef) {
        debug_assert!(
            !self.by_offset.contains_key(&slot.offset),
            "free slot at offset {} inserted twice",
            slot.offset
        );
        self.by_offset.insert(slot.offset, slot.total_len);
        self.by_len.insert((slot.total_len, slot.offset));
    }

    /// Take the first slot able to hold `total_len` bytes, if any.
    pub fn take(&mut self, total_len: u32) -> Option<SlotRef> {
        let &(len, offset) = self.by_len.range((total_len, 0)..).next()?;
        self.by_len.remove(&(len, offset));
        self.by_offset.remove(&offset);
        Some(SlotRef { offset, total_len: len })
    }

    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    /// Total reclaimable bytes (diagnostics).
    pub fn reclaimable_bytes(&self) -> u64 {
        self.by_offset.values().map(|&len| len as u64).sum()
    }

    pub fn clear(&mut self) {
        self.by_offset.clear();
        self.by_len.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(offset: u64, total_len: u32) -> SlotRef {
        SlotRef { offset, total_len }
    }

    #[test]
    fn take_prefers_smallest_sufficient_length() {
        let mut free = FreeIndex::new();
        free.insert(slot(100, 64));
        free.insert(slot(200, 16));
        free.insert(slot(300, 32));

        assert_eq!(free.take(20), Some(slot(300, 32)));
        assert_eq!(free.take(20), Some(slot(100, 64)));
        assert_eq!(free.take(20), None);
        assert_eq!(free.len(), 1); // the 16-byte slot is still there
    }

    #[test]
    fn ties_break_by_lowest_offset() {
        let mut free = FreeIndex::new();
        free.insert(slot(500, 24));
        free.insert(slot(100, 24));
        free.insert(slot(300, 24));

        assert_eq!(free.take(24), Some(slot(100, 24)));
        assert_eq!(free.take(24), Some(slot(300, 24)));
        assert_eq!(free.take(24), Some(slot(500, 24)));
    }

    #[test]
    fn exact_fit_is_found() {
        let mut free = FreeIndex::new();
        free.insert(slot(36, 21));
        assert_eq!(free.take(21), Some(slot(36, 21)));
        assert!(free.is_empty());
    }

    #[test]
    fn never_returns_a_shorter_slot() {
        let mut free = FreeIndex::new();
        free.insert(slot(36, 20));
        assert_eq!(free.take(21), None);
        assert_eq!(free.len(), 1);
    }

    #[test]
    fn reclaimable_bytes_tracks_inserts_and_takes() {
        let mut free = FreeIndex::new();
        free.insert(slot(0, 10));
        free.insert(slot(10, 30));
        assert_eq!(free.reclaimable_bytes(), 40);
        free.take(5);
        assert_eq!(free.reclaimable_bytes(), 30);
    }

    #[test]
    fn allocated_index_basics() {
        let mut idx = AllocatedIndex::new();
        assert!(idx.insert(1u32, slot(36, 10)).is_none());
        assert_eq!(idx.insert(1, slot(46, 12)), Some(slot(36, 10)));
        assert_eq!(idx.get(&1), Some(slot(46, 12)));
        assert_eq!(idx.remove(&1), Some(slot(46, 12)));
        assert!(idx.is_empty());
    }
}
