//! In-process tier of the result cache.

use crate::fingerprint::Fingerprint;
use crate::score::Scorer;
use rangedb_engine::Rows;
use rangedb_fetch::FileVersion;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct MemoryEntry {
    pub(crate) rows: Arc<Rows>,
    pub(crate) version: FileVersion,
    pub(crate) size: usize,
    pub(crate) expires_at: i64,
    pub(crate) last_access: i64,
    pub(crate) hits: u64,
}

impl MemoryEntry {
    pub(crate) fn new(rows: Arc<Rows>, version: FileVersion, expires_at: i64, now: i64, hits: u64) -> Self {
        let size = rows.approx_size();
        Self { rows, version, size, expires_at, last_access: now, hits }
    }
}

/// Bounded by both total (approximate) bytes and entry count. Times are Unix
/// milliseconds supplied by the caller.
pub(crate) struct MemoryTier {
    max_bytes: usize,
    max_entries: usize,
    bytes: usize,
    entries: HashMap<Fingerprint, MemoryEntry>,
    scorer: Scorer,
}

impl MemoryTier {
    pub(crate) fn new(max_bytes: usize, max_entries: usize, scorer: Scorer) -> Self {
        Self { max_bytes, max_entries, bytes: 0, entries: HashMap::new(), scorer }
    }

    /// Look up a live entry for `version`; expired or mismatched entries are
    /// dropped on the way.
    pub(crate) fn get(&mut self, fingerprint: &Fingerprint, version: &FileVersion, now: i64) -> Option<Arc<Rows>> {
        let entry = self.entries.get_mut(fingerprint)?;
        if entry.expires_at <= now || entry.version != *version {
            self.remove(fingerprint);
            return None;
        }
        entry.hits += 1;
        entry.last_access = now;
        Some(Arc::clone(&entry.rows))
    }

    /// Insert an entry, returning how many others were evicted to make room.
    /// Entries larger than the whole tier are not kept.
    pub(crate) fn insert(&mut self, fingerprint: Fingerprint, entry: MemoryEntry, now: i64) -> usize {
        if entry.size > self.max_bytes || self.max_entries == 0 {
            return 0;
        }
        self.remove(&fingerprint);
        self.bytes += entry.size;
        self.entries.insert(fingerprint, entry);

        let mut evicted = 0;
        while self.bytes > self.max_bytes || self.entries.len() > self.max_entries {
            let victim = self
                .entries
                .iter()
                .filter(|(key, _)| **key != fingerprint)
                .map(|(key, entry)| (*key, self.scorer.score(now, entry.last_access, entry.hits)))
                .min_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(key, _)| key);
            let Some(victim) = victim else {
                break;
            };
            self.remove(&victim);
            evicted += 1;
        }
        evicted
    }

    pub(crate) fn remove(&mut self, fingerprint: &Fingerprint) -> bool {
        match self.entries.remove(fingerprint) {
            Some(entry) => {
                self.bytes -= entry.size;
                true
            },
            None => false,
        }
    }

    pub(crate) fn purge_expired(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        let bytes = &mut self.bytes;
        self.entries.retain(|_, entry| {
            let live = entry.expires_at > now;
            if !live {
                *bytes -= entry.size;
            }
            live
        });
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }
}
