//! Byte-bounded LRU with pin counts.

use crate::PageKey;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

struct Slot {
    data: Bytes,
    tick: u64,
    pins: u32,
}

/// Least-recently-used page store bounded by total bytes.
///
/// Recency is tracked with a monotonically increasing tick; `order` maps
/// ticks back to keys so the oldest entry is always first. Pinned entries are
/// skipped by the evictor, so the byte bound can be exceeded while (and only
/// while) pins are held.
pub(crate) struct Lru {
    capacity: u64,
    bytes: u64,
    tick: u64,
    entries: HashMap<PageKey, Slot>,
    order: BTreeMap<u64, PageKey>,
}

impl Lru {
    pub(crate) fn new(capacity: u64) -> Self {
        Self { capacity, bytes: 0, tick: 0, entries: HashMap::new(), order: BTreeMap::new() }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &PageKey) {
        let tick = self.next_tick();
        if let Some(slot) = self.entries.get_mut(key) {
            self.order.remove(&slot.tick);
            slot.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }

    pub(crate) fn get(&mut self, key: &PageKey) -> Option<Bytes> {
        let data = self.entries.get(key)?.data.clone();
        self.touch(key);
        Some(data)
    }

    pub(crate) fn contains(&self, key: &PageKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert a page, returning how many pages were evicted to make room.
    pub(crate) fn insert(&mut self, key: PageKey, data: Bytes) -> usize {
        if self.entries.contains_key(&key) {
            // Page contents never change for a given key.
            self.touch(&key);
            return 0;
        }
        let tick = self.next_tick();
        self.bytes += data.len() as u64;
        self.order.insert(tick, key.clone());
        self.entries.insert(key, Slot { data, tick, pins: 0 });
        self.evict()
    }

    /// Whether `data_len` more bytes fit without evicting anything.
    pub(crate) fn has_room_for(&self, data_len: u64) -> bool {
        self.bytes + data_len <= self.capacity
    }

    pub(crate) fn pin(&mut self, key: &PageKey) -> bool {
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.pins += 1;
                true
            },
            None => false,
        }
    }

    pub(crate) fn unpin(&mut self, key: &PageKey) {
        if let Some(slot) = self.entries.get_mut(key) {
            slot.pins = slot.pins.saturating_sub(1);
        }
    }

    /// Drop unpinned pages, oldest first, until back under capacity.
    pub(crate) fn evict(&mut self) -> usize {
        let mut evicted = 0;
        while self.bytes > self.capacity {
            let victim = self
                .order
                .iter()
                .find(|(_, key)| self.entries.get(*key).is_some_and(|slot| slot.pins == 0))
                .map(|(tick, key)| (*tick, key.clone()));
            let Some((tick, key)) = victim else {
                break;
            };
            self.order.remove(&tick);
            if let Some(slot) = self.entries.remove(&key) {
                self.bytes -= slot.data.len() as u64;
                evicted += 1;
            }
        }
        evicted
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangedb_fetch::FileVersion;

    fn key(index: u64) -> PageKey {
        PageKey { index, version: FileVersion::new("v1") }
    }

    fn page(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut lru = Lru::new(300);
        assert_eq!(lru.insert(key(0), page(100)), 0);
        assert_eq!(lru.insert(key(1), page(100)), 0);
        assert_eq!(lru.insert(key(2), page(100)), 0);
        // Touch page 0 so that page 1 becomes the oldest.
        assert!(lru.get(&key(0)).is_some());
        assert_eq!(lru.insert(key(3), page(100)), 1);
        assert!(lru.contains(&key(0)));
        assert!(!lru.contains(&key(1)));
        assert_eq!(lru.bytes(), 300);
    }

    #[test]
    fn test_bounded_by_bytes_not_entries() {
        let mut lru = Lru::new(250);
        lru.insert(key(0), page(200));
        lru.insert(key(1), page(40));
        assert_eq!(lru.len(), 2);
        // A short edge page still counts only its real length.
        assert_eq!(lru.insert(key(2), page(10)), 0);
        assert_eq!(lru.insert(key(3), page(100)), 1);
        assert!(!lru.contains(&key(0)));
    }

    #[test]
    fn test_pinned_pages_survive_eviction() {
        let mut lru = Lru::new(200);
        lru.insert(key(0), page(100));
        assert!(lru.pin(&key(0)));
        lru.insert(key(1), page(100));
        lru.insert(key(2), page(100));
        assert!(lru.contains(&key(0)), "pinned page evicted");
        assert!(!lru.contains(&key(1)));

        lru.unpin(&key(0));
        lru.insert(key(3), page(100));
        assert!(!lru.contains(&key(0)));
    }

    #[test]
    fn test_only_unpinned_pages_are_victims() {
        let mut lru = Lru::new(100);
        lru.insert(key(0), page(100));
        lru.pin(&key(0));
        lru.insert(key(1), page(100));
        assert!(lru.contains(&key(0)));
        assert!(!lru.contains(&key(1)));
        assert_eq!(lru.bytes(), 100);
    }

    #[test]
    fn test_pins_may_hold_cache_over_capacity() {
        let mut lru = Lru::new(1000);
        lru.insert(key(0), page(100));
        lru.insert(key(1), page(100));
        lru.pin(&key(0));
        lru.pin(&key(1));
        lru.capacity = 100;
        assert_eq!(lru.evict(), 0);
        assert_eq!(lru.bytes(), 200);
        lru.unpin(&key(1));
        assert_eq!(lru.evict(), 1);
        assert_eq!(lru.bytes(), 100);
    }

    #[test]
    fn test_reinsert_is_a_touch() {
        let mut lru = Lru::new(1000);
        lru.insert(key(0), page(100));
        lru.insert(key(0), page(100));
        assert_eq!(lru.bytes(), 100);
        assert_eq!(lru.len(), 1);
    }
}
