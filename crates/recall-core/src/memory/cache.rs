//! Bounded in-process cache of memory records.
//!
//! All state sits behind one mutex. Recency is a monotonically increasing
//! access tick indexed by a `BTreeMap`, so the least recently used entry is
//! always the first key. Only clean entries are evicted: a dirty record is
//! the sole copy of an unsynced write.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use recall_state::{MemoryRecord, MemorySearch};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    record: MemoryRecord,
    dirty: bool,
    version: u64,
    last_access: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    recency: BTreeMap<u64, String>,
    tombstones: HashSet<String>,
    tick: u64,
    next_version: u64,
    evictions: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn next_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn touch(&mut self, id: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(id) {
            self.recency.remove(&entry.last_access);
            entry.last_access = tick;
            self.recency.insert(tick, id.to_string());
        }
    }

    fn insert(&mut self, record: MemoryRecord, dirty: bool) -> u64 {
        let id = record.id.clone();
        let tick = self.next_tick();
        let version = self.next_version();
        if let Some(old) = self.entries.remove(&id) {
            self.recency.remove(&old.last_access);
        }
        self.recency.insert(tick, id.clone());
        self.tombstones.remove(&id);
        self.entries.insert(
            id,
            CacheEntry {
                record,
                dirty,
                version,
                last_access: tick,
            },
        );
        version
    }

    fn remove(&mut self, id: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(id)?;
        self.recency.remove(&entry.last_access);
        Some(entry)
    }

    /// Mutate an existing entry in place, marking it dirty.
    fn modify<F>(&mut self, id: &str, f: F) -> Option<MemoryRecord>
    where
        F: FnOnce(&mut MemoryRecord),
    {
        let version = self.next_version();
        let entry = self.entries.get_mut(id)?;
        f(&mut entry.record);
        entry.record.touch();
        entry.dirty = true;
        entry.version = version;
        Some(entry.record.clone())
    }
}

/// One entry as seen by a snapshot.
#[derive(Debug, Clone)]
pub struct CachedRecord {
    pub record: MemoryRecord,
    pub version: u64,
    pub dirty: bool,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub dirty: usize,
    pub tombstones: usize,
    pub capacity: usize,
    pub evictions: u64,
}

/// Bounded LRU map from memory id to record with dirty tracking.
#[derive(Debug)]
pub struct LocalCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl LocalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a locally written record (dirty). Returns its version.
    pub fn put(&self, record: MemoryRecord) -> u64 {
        let mut inner = self.lock();
        let version = inner.insert(record, true);
        self.evict_locked(&mut inner);
        version
    }

    /// Populate from the backing store (clean).
    ///
    /// Skipped for tombstoned ids and for ids holding an unsynced local
    /// write, which is newer than anything the store can return.
    pub fn put_clean(&self, record: MemoryRecord) -> bool {
        let mut inner = self.lock();
        if inner.tombstones.contains(&record.id) {
            return false;
        }
        if inner.entries.get(&record.id).map(|e| e.dirty).unwrap_or(false) {
            return false;
        }
        inner.insert(record, false);
        self.evict_locked(&mut inner);
        true
    }

    /// Insert a new record together with the reciprocal side of its links.
    ///
    /// `links` are candidates, strongest first; at most `max_links` are
    /// kept. Peers present in the cache gain a back-reference and become
    /// dirty. Peers that are gone or already hold `max_links` links are
    /// skipped, so the graph stays symmetric and no record exceeds the cap.
    pub fn insert_linked(
        &self,
        mut record: MemoryRecord,
        links: Vec<String>,
        max_links: usize,
    ) -> MemoryRecord {
        let mut inner = self.lock();
        let mut kept = Vec::with_capacity(max_links);

        for peer_id in links {
            if kept.len() >= max_links {
                break;
            }
            if peer_id == record.id || inner.tombstones.contains(&peer_id) {
                continue;
            }
            let full = inner
                .entries
                .get(&peer_id)
                .is_some_and(|e| e.record.related_ids.len() >= max_links);
            if full {
                debug!(memory_id = %record.id, peer_id = %peer_id, "Peer at link cap");
                continue;
            }
            let new_id = record.id.clone();
            let linked = inner.modify(&peer_id, |peer| {
                peer.related_ids.insert(new_id);
            });
            if linked.is_some() {
                kept.push(peer_id);
            } else {
                debug!(memory_id = %record.id, peer_id = %peer_id, "Dropping link to vanished peer");
            }
        }

        record.related_ids.extend(kept);
        inner.insert(record.clone(), true);
        self.evict_locked(&mut inner);
        record
    }

    /// Look up by id, refreshing recency.
    pub fn get(&self, id: &str) -> Option<MemoryRecord> {
        let mut inner = self.lock();
        let record = inner.entries.get(id).map(|e| e.record.clone())?;
        inner.touch(id);
        Some(record)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.lock().tombstones.contains(id)
    }

    /// Drop the local copy and leave a tombstone until the backing store
    /// confirms the delete. Returns whether a local copy existed.
    pub fn delete(&self, id: &str) -> bool {
        let mut inner = self.lock();
        inner.tombstones.insert(id.to_string());
        inner.remove(id).is_some()
    }

    /// Apply `f` to a cached record and mark it dirty.
    pub fn modify<F>(&self, id: &str, f: F) -> Option<MemoryRecord>
    where
        F: FnOnce(&mut MemoryRecord),
    {
        let mut inner = self.lock();
        let updated = inner.modify(id, f)?;
        inner.touch(id);
        Some(updated)
    }

    /// Records matching `search`, ranked and limited.
    pub fn list(&self, search: &MemorySearch) -> Vec<MemoryRecord> {
        let inner = self.lock();
        let mut hits: Vec<MemoryRecord> = inner
            .entries
            .values()
            .filter(|e| search.matches(&e.record))
            .map(|e| e.record.clone())
            .collect();
        drop(inner);
        search.rank(&mut hits);
        hits
    }

    /// Up to `limit` records, most recently used first.
    pub fn recent(&self, limit: usize) -> Vec<MemoryRecord> {
        let inner = self.lock();
        inner
            .recency
            .values()
            .rev()
            .filter_map(|id| inner.entries.get(id))
            .take(limit)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Evict clean LRU entries until within capacity. Returns how many went.
    pub fn evict_if_over_capacity(&self) -> usize {
        let mut inner = self.lock();
        self.evict_locked(&mut inner)
    }

    fn evict_locked(&self, inner: &mut CacheInner) -> usize {
        if inner.entries.len() <= self.capacity {
            return 0;
        }
        let excess = inner.entries.len() - self.capacity;
        let victims: Vec<String> = inner
            .recency
            .values()
            .filter(|id| inner.entries.get(*id).map(|e| !e.dirty).unwrap_or(false))
            .take(excess)
            .cloned()
            .collect();

        for id in &victims {
            inner.remove(id);
        }
        inner.evictions += victims.len() as u64;

        if victims.len() < excess {
            warn!(
                entries = inner.entries.len(),
                capacity = self.capacity,
                "Cache over capacity with unsynced entries"
            );
        }
        victims.len()
    }

    /// Dirty records with their versions, oldest write first.
    pub fn dirty_snapshot(&self) -> Vec<(MemoryRecord, u64)> {
        let inner = self.lock();
        let mut dirty: Vec<(MemoryRecord, u64)> = inner
            .entries
            .values()
            .filter(|e| e.dirty)
            .map(|e| (e.record.clone(), e.version))
            .collect();
        dirty.sort_by_key(|(_, version)| *version);
        dirty
    }

    /// Clear the dirty flag if the entry was not rewritten since `version`.
    pub fn mark_synced(&self, id: &str, version: u64) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(id) {
            Some(entry) if entry.version == version => {
                entry.dirty = false;
                true
            }
            _ => false,
        }
    }

    /// Replace an unsynced entry with a newer stored copy, clean, if the
    /// entry was not rewritten since `version`.
    pub fn replace_if_version(&self, record: MemoryRecord, version: u64) -> bool {
        let mut inner = self.lock();
        if inner.entries.get(&record.id).map(|e| e.version) != Some(version) {
            return false;
        }
        inner.insert(record, false);
        true
    }

    pub fn tombstones(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().tombstones.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear_tombstone(&self, id: &str) {
        self.lock().tombstones.remove(id);
    }

    /// Every entry with its version and dirty flag.
    pub fn snapshot(&self) -> Vec<CachedRecord> {
        self.lock()
            .entries
            .values()
            .map(|e| CachedRecord {
                record: e.record.clone(),
                version: e.version,
                dirty: e.dirty,
            })
            .collect()
    }

    /// Remove and tombstone `id` for consolidation.
    ///
    /// With `expected_version`, only if the entry is still at that version.
    /// Without, only if no unsynced local write exists. Returns `false` when
    /// the record was rewritten and must be kept.
    pub fn remove_if_unchanged(&self, id: &str, expected_version: Option<u64>) -> bool {
        let mut inner = self.lock();
        let unchanged = match (inner.entries.get(id), expected_version) {
            (Some(entry), Some(version)) => entry.version == version,
            (Some(entry), None) => !entry.dirty,
            (None, Some(_)) => false,
            (None, None) => true,
        };
        if unchanged {
            inner.remove(id);
            inner.tombstones.insert(id.to_string());
        }
        unchanged
    }

    /// Set a new importance if the entry is still at `version`.
    pub fn set_importance_if_version(&self, id: &str, version: u64, score: f64) -> bool {
        let mut inner = self.lock();
        if inner.entries.get(id).map(|e| e.version) != Some(version) {
            return false;
        }
        inner
            .modify(id, |record| record.importance_score = score)
            .is_some()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            dirty: inner.entries.values().filter(|e| e.dirty).count(),
            tombstones: inner.tombstones.len(),
            capacity: self.capacity,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_state::MemoryType;
    use std::collections::BTreeSet;

    fn record(content: &str) -> MemoryRecord {
        MemoryRecord::new(
            content,
            BTreeSet::from(["t".to_string()]),
            MemoryType::Context,
            vec![content.to_lowercase()],
            0.3,
        )
    }

    #[test]
    fn test_put_get_and_dirty() {
        let cache = LocalCache::new(10);
        let r = record("alpha");
        cache.put(r.clone());

        assert_eq!(cache.get(&r.id).unwrap().content, "alpha");
        assert_eq!(cache.stats().dirty, 1);
    }

    #[test]
    fn test_evicts_least_recently_used_clean_entry() {
        let cache = LocalCache::new(2);
        let a = record("alpha");
        let b = record("beta");
        let c = record("gamma");
        cache.put_clean(a.clone());
        cache.put_clean(b.clone());
        // Touch a so b becomes the LRU entry.
        cache.get(&a.id);
        cache.put_clean(c.clone());

        assert!(cache.contains(&a.id));
        assert!(!cache.contains(&b.id));
        assert!(cache.contains(&c.id));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_dirty_entries_are_never_evicted() {
        let cache = LocalCache::new(1);
        let a = record("alpha");
        let b = record("beta");
        cache.put(a.clone());
        cache.put(b.clone());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);

        let (_, version) = cache
            .dirty_snapshot()
            .into_iter()
            .find(|(r, _)| r.id == a.id)
            .unwrap();
        assert!(cache.mark_synced(&a.id, version));
        assert_eq!(cache.evict_if_over_capacity(), 1);
        assert!(!cache.contains(&a.id));
        assert!(cache.contains(&b.id));
    }

    #[test]
    fn test_rewrite_during_sync_stays_dirty() {
        let cache = LocalCache::new(10);
        let r = record("alpha");
        cache.put(r.clone());
        let (_, version) = cache.dirty_snapshot().pop().unwrap();

        cache.modify(&r.id, |rec| {
            rec.tags.insert("late".into());
        });
        assert!(!cache.mark_synced(&r.id, version));
        assert_eq!(cache.stats().dirty, 1);
    }

    #[test]
    fn test_replace_if_version_takes_stored_copy_clean() {
        let cache = LocalCache::new(10);
        let r = record("alpha");
        let version = cache.put(r.clone());

        let mut stored = r.clone();
        stored.tags.insert("remote".into());
        assert!(cache.replace_if_version(stored.clone(), version));
        assert!(cache.get(&r.id).unwrap().tags.contains("remote"));
        assert_eq!(cache.stats().dirty, 0);

        let version = cache.put(r.clone());
        cache.modify(&r.id, |rec| rec.importance_score = 0.9);
        assert!(!cache.replace_if_version(stored, version));
        assert_eq!(cache.stats().dirty, 1);
    }

    #[test]
    fn test_delete_leaves_tombstone_and_blocks_read_through() {
        let cache = LocalCache::new(10);
        let r = record("alpha");
        cache.put(r.clone());

        assert!(cache.delete(&r.id));
        assert!(cache.get(&r.id).is_none());
        assert!(cache.is_tombstoned(&r.id));
        assert!(!cache.put_clean(r.clone()));

        cache.clear_tombstone(&r.id);
        assert!(cache.tombstones().is_empty());
    }

    #[test]
    fn test_put_clean_does_not_clobber_unsynced_write() {
        let cache = LocalCache::new(10);
        let mut r = record("alpha");
        cache.put(r.clone());
        r.tags.insert("stale".into());
        assert!(!cache.put_clean(r.clone()));
        assert!(!cache.get(&r.id).unwrap().tags.contains("stale"));
    }

    #[test]
    fn test_insert_linked_is_bidirectional() {
        let cache = LocalCache::new(10);
        let peer = record("alpha");
        cache.put_clean(peer.clone());

        let new = record("beta");
        let stored = cache.insert_linked(new.clone(), vec![peer.id.clone(), "vanished".into()], 5);

        assert!(stored.related_ids.contains(&peer.id));
        assert!(!stored.related_ids.contains("vanished"));
        let peer_now = cache.get(&peer.id).unwrap();
        assert!(peer_now.related_ids.contains(&new.id));
        // Both the new record and the peer need syncing.
        assert_eq!(cache.stats().dirty, 2);
    }

    #[test]
    fn test_link_cap_holds_on_both_sides() {
        let cache = LocalCache::new(50);
        let hub = record("hub");
        cache.put_clean(hub.clone());

        let mut spokes = Vec::new();
        for i in 0..8 {
            spokes.push(cache.insert_linked(record(&format!("spoke {i}")), vec![hub.id.clone()], 5));
        }

        let hub_now = cache.get(&hub.id).unwrap();
        assert_eq!(hub_now.related_ids.len(), 5);
        for spoke in &spokes {
            assert_eq!(
                spoke.related_ids.contains(&hub.id),
                hub_now.related_ids.contains(&spoke.id)
            );
        }
        assert!(spokes[7].related_ids.is_empty());
    }

    #[test]
    fn test_full_peer_is_passed_over_for_next_candidate() {
        let cache = LocalCache::new(50);
        let mut full = record("full");
        full.related_ids = (0..2).map(|i| format!("other-{i}")).collect();
        cache.put_clean(full.clone());
        let open = record("open");
        cache.put_clean(open.clone());

        let stored = cache.insert_linked(record("new"), vec![full.id.clone(), open.id.clone()], 2);
        assert_eq!(stored.related_ids.len(), 1);
        assert!(stored.related_ids.contains(&open.id));
        assert_eq!(cache.get(&full.id).unwrap().related_ids.len(), 2);
    }

    #[test]
    fn test_list_filters_and_ranks() {
        let cache = LocalCache::new(10);
        let mut goal = record("goal");
        goal.memory_type = MemoryType::Goal;
        goal.importance_score = 0.8;
        cache.put(goal.clone());
        cache.put(record("context"));

        let hits = cache.list(&MemorySearch::all().with_type(Some(MemoryType::Goal)));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, goal.id);
        assert_eq!(cache.list(&MemorySearch::all().with_limit(1))[0].id, goal.id);
    }

    #[test]
    fn test_remove_if_unchanged() {
        let cache = LocalCache::new(10);
        let r = record("alpha");
        let version = cache.put(r.clone());

        cache.modify(&r.id, |rec| rec.importance_score = 0.9);
        assert!(!cache.remove_if_unchanged(&r.id, Some(version)));
        assert!(cache.contains(&r.id));
        // Dirty and no expected version: kept as well.
        assert!(!cache.remove_if_unchanged(&r.id, None));

        let current = cache.snapshot().pop().unwrap().version;
        assert!(cache.remove_if_unchanged(&r.id, Some(current)));
        assert!(cache.is_tombstoned(&r.id));
    }

    #[test]
    fn test_recent_orders_by_access() {
        let cache = LocalCache::new(10);
        let a = record("alpha");
        let b = record("beta");
        cache.put(a.clone());
        cache.put(b.clone());
        cache.get(&a.id);

        let recent = cache.recent(1);
        assert_eq!(recent[0].id, a.id);
    }
}
