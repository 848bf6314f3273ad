//! # Weighted LRU Index
//!
//! In-memory index of the cache: remote reference name mapped to its
//! [`CachedFile`] record, bounded by the total kilobyte weight of all
//! entries.
//!
//! The whole index lives behind a single mutex. Serializing all mutations
//! through one partition costs some concurrent-write throughput but
//! guarantees a true global least-recently-used order: the LRU entry
//! anywhere in the cache is always the first one evicted.
//!
//! Evicted and invalidated records are pushed onto a removal channel;
//! the physical file deletion happens on the consumer side, never on the
//! thread performing the insert.

use std::sync::mpsc::Sender;
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;

use crate::cached_file::CachedFile;

pub struct FileCacheIndex {
    state: Mutex<IndexState>,
    removal_tx: Sender<CachedFile>,
}

struct IndexState {
    entries: LruCache<String, CachedFile>,
    weighted_size: u64,
    kilobyte_capacity: u64,
}

impl FileCacheIndex {
    pub fn new(kilobyte_capacity: u64, removal_tx: Sender<CachedFile>) -> Self {
        Self {
            state: Mutex::new(IndexState {
                entries: LruCache::unbounded(),
                weighted_size: 0,
                kilobyte_capacity,
            }),
            removal_tx,
        }
    }

    /// Looks up an entry, promoting it to most recently used.
    pub fn get(&self, remote_ref_name: &str) -> Option<CachedFile> {
        self.lock().entries.get(remote_ref_name).cloned()
    }

    /// True if the entry is present; does not affect recency order.
    pub fn contains(&self, remote_ref_name: &str) -> bool {
        self.lock().entries.contains(remote_ref_name)
    }

    /// Inserts an entry and evicts least recently used entries until the
    /// total weight fits the capacity again.
    ///
    /// A replaced record for the same name and every evicted record are
    /// scheduled for physical removal. An entry heavier than the whole
    /// capacity is evicted right back out by the same loop.
    pub fn put(&self, cached_file: CachedFile) {
        let weight = cached_file.weight() as u64;
        let name = cached_file.remote_ref_name().to_owned();
        let mut state = self.lock();
        if let Some(previous) = state.entries.put(name, cached_file) {
            state.weighted_size = state.weighted_size.saturating_sub(previous.weight() as u64);
            self.schedule_removal(previous);
        }
        state.weighted_size += weight;
        while state.weighted_size > state.kilobyte_capacity {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.weighted_size =
                        state.weighted_size.saturating_sub(evicted.weight() as u64);
                    self.schedule_removal(evicted);
                }
                None => break,
            }
        }
    }

    /// Drops the entry for the specified name, scheduling its physical
    /// removal.
    pub fn invalidate(&self, remote_ref_name: &str) {
        let mut state = self.lock();
        if let Some(previous) = state.entries.pop(remote_ref_name) {
            state.weighted_size = state.weighted_size.saturating_sub(previous.weight() as u64);
            self.schedule_removal(previous);
        }
    }

    /// Drops every entry, scheduling physical removal for each.
    pub fn invalidate_all(&self) {
        let mut state = self.lock();
        while let Some((_, evicted)) = state.entries.pop_lru() {
            self.schedule_removal(evicted);
        }
        state.weighted_size = 0;
    }

    /// Replaces the index with an empty structure at the new capacity.
    ///
    /// The dropped entries are NOT scheduled for removal: their files stay
    /// on disk and are expected to be re-registered by a fresh filesystem
    /// scan, which evicts whatever no longer fits.
    pub fn rebuild(&self, kilobyte_capacity: u64) {
        let mut state = self.lock();
        state.entries = LruCache::unbounded();
        state.weighted_size = 0;
        state.kilobyte_capacity = kilobyte_capacity;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn kilobyte_capacity(&self) -> u64 {
        self.lock().kilobyte_capacity
    }

    /// Sums the weight of every live entry without disturbing the recency
    /// order. O(n) over the current contents.
    pub fn weighted_kilobytes(&self) -> u64 {
        self.lock()
            .entries
            .iter()
            .map(|(_, cached_file)| cached_file.weight() as u64)
            .sum()
    }

    fn schedule_removal(&self, cached_file: CachedFile) {
        if self.removal_tx.send(cached_file).is_err() {
            log::warn!("schedule_removal: removal workers are gone, dropping event");
        }
    }

    // A poisoned lock only means another thread panicked mid-operation;
    // the index state itself remains usable.
    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::mpsc::{channel, Receiver};

    use super::*;

    struct Fixture {
        index: FileCacheIndex,
        removal_rx: Receiver<CachedFile>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(kilobyte_capacity: u64) -> Self {
            let (removal_tx, removal_rx) = channel();
            Self {
                index: FileCacheIndex::new(kilobyte_capacity, removal_tx),
                removal_rx,
                dir: tempfile::tempdir().expect("failed to create temp dir"),
            }
        }

        fn entry(&self, name: &str, kilobytes: usize) -> CachedFile {
            let path = self.dir.path().join(Path::new(name).file_name().unwrap());
            fs::write(&path, vec![0u8; kilobytes * 1024]).expect("failed to write file");
            CachedFile::new(name.into(), path)
        }

        fn removed_names(&self) -> Vec<String> {
            self.removal_rx
                .try_iter()
                .map(|f| f.remote_ref_name().to_owned())
                .collect()
        }
    }

    #[test]
    fn test_capacity_invariant_holds_across_inserts() {
        let fixture = Fixture::new(10);
        for i in 0..8 {
            fixture.index.put(fixture.entry(&format!("/v/f{i}"), 3));
            assert!(
                fixture.index.weighted_kilobytes() <= 10,
                "total weight exceeded capacity after insert {i}"
            );
        }
        assert_eq!(3, fixture.index.len());
    }

    #[test]
    fn test_global_lru_eviction_order() {
        let fixture = Fixture::new(9);
        fixture.index.put(fixture.entry("/v/a", 3));
        fixture.index.put(fixture.entry("/v/b", 3));
        fixture.index.put(fixture.entry("/v/c", 3));

        // reading A promotes it, leaving B as the least recently used
        assert!(fixture.index.get("/v/a").is_some());

        fixture.index.put(fixture.entry("/v/d", 3));

        assert_eq!(vec!["/v/b".to_owned()], fixture.removed_names());
        assert!(fixture.index.contains("/v/a"));
        assert!(fixture.index.contains("/v/c"));
        assert!(fixture.index.contains("/v/d"));
    }

    #[test]
    fn test_replace_schedules_removal_of_previous_record() {
        let fixture = Fixture::new(10);
        fixture.index.put(fixture.entry("/v/a", 2));
        fixture.index.put(fixture.entry("/v/a", 4));

        assert_eq!(vec!["/v/a".to_owned()], fixture.removed_names());
        assert_eq!(1, fixture.index.len());
        assert_eq!(4, fixture.index.weighted_kilobytes());
    }

    #[test]
    fn test_oversized_entry_is_evicted_immediately() {
        let fixture = Fixture::new(4);
        fixture.index.put(fixture.entry("/v/huge", 5));
        assert!(fixture.index.is_empty());
        assert_eq!(vec!["/v/huge".to_owned()], fixture.removed_names());
        assert_eq!(0, fixture.index.weighted_kilobytes());
    }

    #[test]
    fn test_contains_does_not_promote() {
        let fixture = Fixture::new(6);
        fixture.index.put(fixture.entry("/v/a", 3));
        fixture.index.put(fixture.entry("/v/b", 3));

        // peeking at A must not rescue it from eviction
        assert!(fixture.index.contains("/v/a"));
        fixture.index.put(fixture.entry("/v/c", 3));

        assert_eq!(vec!["/v/a".to_owned()], fixture.removed_names());
    }

    #[test]
    fn test_invalidate_all_drains_every_entry() {
        let fixture = Fixture::new(100);
        fixture.index.put(fixture.entry("/v/a", 1));
        fixture.index.put(fixture.entry("/v/b", 1));
        fixture.index.invalidate_all();

        assert!(fixture.index.is_empty());
        assert_eq!(0, fixture.index.weighted_kilobytes());
        assert_eq!(2, fixture.removed_names().len());
    }

    #[test]
    fn test_rebuild_drops_entries_without_removal_events() {
        let fixture = Fixture::new(100);
        let entry = fixture.entry("/v/a", 1);
        let local_path = entry.local_path().to_owned();
        fixture.index.put(entry);
        fixture.index.rebuild(50);

        assert!(fixture.index.is_empty());
        assert_eq!(50, fixture.index.kilobyte_capacity());
        assert!(fixture.removed_names().is_empty());
        // the backing file is untouched, a rescan is expected to find it
        assert!(local_path.is_file());
    }
}
