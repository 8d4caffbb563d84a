//! Bounded in-memory record cache
//!
//! One mutex guards the key map and the LRU index together, so LRU
//! order can never disagree with membership. Records themselves carry
//! their own lock; the cache lock is held only for map surgery, never
//! across external-cache I/O.
//!
//! Eviction has two triggers. Capacity pressure evicts in strict LRU
//! order but refuses records that are pinned or have backend work in
//! flight; when even that fails the cache runs over capacity and logs
//! it rather than blocking a lookup. Age eviction uses three clocks on
//! `last_upd_time`: the standard TTL, a hard maximum, and a shorter
//! negative TTL for records whose answer was "not found".

use crate::extcache::ExtCache;
use crate::record::{unix_now, Aspect, FileRecord, InfoStatus, SubItem};
use metafed_common::config::CacheConfig;
use metafed_common::path;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RecordCache {
    max_items: usize,
    ttl: u64,
    maxttl: u64,
    ttl_negative: u64,
    ext: Option<Arc<dyn ExtCache>>,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    records: HashMap<String, Arc<FileRecord>>,
    /// LRU index: monotonic tick -> key, plus the reverse map so a
    /// touch can relocate an entry in O(log n)
    lru: BTreeMap<u64, String>,
    lru_tick: HashMap<String, u64>,
    tick: u64,
}

impl CacheInner {
    fn bump(&mut self, key: &str) {
        if let Some(old) = self.lru_tick.get(key) {
            self.lru.remove(old);
        }
        self.tick += 1;
        self.lru.insert(self.tick, key.to_string());
        self.lru_tick.insert(key.to_string(), self.tick);
    }

    fn remove(&mut self, key: &str) {
        self.records.remove(key);
        if let Some(t) = self.lru_tick.remove(key) {
            self.lru.remove(&t);
        }
    }
}

impl RecordCache {
    #[must_use]
    pub fn new(cfg: &CacheConfig, ext: Option<Arc<dyn ExtCache>>) -> Self {
        Self {
            max_items: cfg.max_items,
            ttl: cfg.item_ttl_secs,
            maxttl: cfg.item_maxttl_secs,
            ttl_negative: cfg.item_ttl_negative_secs,
            ext,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Look up a record, creating it on first reference. A hit bumps
    /// the LRU position and the reference clock but not the TTL clock.
    /// A miss may first have to make room; a brand-new record is then
    /// hydrated from the external cache with the cache lock released.
    /// `want_meta` asks for the metadata snapshot, `want_subitems` for
    /// the children/replica snapshot; the matching aspects are marked
    /// pending for the duration of the fetch, so concurrent pressure
    /// cannot evict the record and waiters see it as in progress.
    pub fn get_or_create(
        &self,
        lfn: &str,
        want_meta: bool,
        want_subitems: bool,
    ) -> Arc<FileRecord> {
        let mut inner = self.inner.lock();
        if let Some(rec) = inner.records.get(lfn) {
            let rec = Arc::clone(rec);
            inner.bump(lfn);
            drop(inner);
            rec.touch();
            return rec;
        }

        while inner.records.len() >= self.max_items {
            if !self.purge_lru_item(&mut inner) {
                break;
            }
        }
        if inner.records.len() >= self.max_items {
            self.purge_expired_locked(&mut inner, unix_now());
        }
        if inner.records.len() >= self.max_items {
            warn!(
                items = inner.records.len(),
                max = self.max_items,
                "cache over capacity, proceeding anyway"
            );
        }

        let mut aspects = Vec::with_capacity(3);
        if want_meta {
            aspects.push(Aspect::Stat);
        }
        if want_subitems {
            aspects.push(Aspect::Locations);
            aspects.push(Aspect::Items);
        }

        let rec = Arc::new(FileRecord::new(lfn));
        for a in &aspects {
            rec.mark_pending(*a);
        }
        inner.records.insert(lfn.to_string(), Arc::clone(&rec));
        inner.bump(lfn);
        drop(inner);

        if let Some(ext) = self.ext.as_deref() {
            if want_meta {
                if let Some(bytes) = ext.get_record(lfn) {
                    if let Err(e) = rec.decode_meta(&bytes) {
                        warn!(lfn, error = %e, "discarding undecodable cached metadata");
                    }
                }
            }
            if want_subitems {
                if let Some(bytes) = ext.get_children(lfn) {
                    if let Err(e) = rec.decode_children(&bytes) {
                        warn!(lfn, error = %e, "discarding undecodable cached children");
                    }
                }
            }
        }
        for a in &aspects {
            rec.mark_done(*a);
        }
        rec
    }

    /// Peek without creating
    #[must_use]
    pub fn get(&self, lfn: &str) -> Option<Arc<FileRecord>> {
        self.inner.lock().records.get(lfn).cloned()
    }

    /// Record a freshly discovered child on its parent's listing, so a
    /// later list of the parent starts warm. The parent record is
    /// created if absent.
    pub fn add_child_to_parent(&self, lfn: &str, max_listing_items: usize) {
        let Some((parent, leaf)) = path::split_parent(lfn) else {
            return;
        };
        let parent_rec = self.get_or_create(parent, true, true);
        parent_rec.add_child(
            SubItem {
                name: leaf.to_string(),
                location: String::new(),
            },
            max_listing_items,
        );
    }

    /// Drop everything known about a path, locally and in the external
    /// cache. Used after writes that invalidate previous knowledge.
    pub fn wipe(&self, lfn: &str) {
        let mut inner = self.inner.lock();
        let existed = inner.records.contains_key(lfn);
        inner.remove(lfn);
        drop(inner);
        debug!(lfn, existed, "wiped record");

        if let Some(ext) = self.ext.as_deref() {
            // No delete on the shared cache; overwrite with an empty
            // snapshot on the short negative clock.
            let blank = FileRecord::new(lfn);
            let ttl = Duration::from_secs(self.ttl_negative);
            if let Ok(bytes) = blank.encode_meta() {
                ext.put_record(lfn, bytes, ttl);
            }
            if let Ok(bytes) = blank.encode_children() {
                ext.put_children(lfn, bytes, ttl);
            }
        }
    }

    /// Periodic maintenance entry point: age sweep, then LRU pressure
    /// relief if the sweep was not enough.
    pub fn tick(&self, now: u64) {
        let mut inner = self.inner.lock();
        self.purge_expired_locked(&mut inner, now);
        while inner.records.len() > self.max_items {
            if !self.purge_lru_item(&mut inner) {
                break;
            }
        }
        debug!(items = inner.records.len(), "cache tick");
    }

    /// Evict the least recently used record. Refuses pinned records and
    /// records with backend work in flight; a refusal stops the whole
    /// LRU pass, since everything behind the victim is younger.
    fn purge_lru_item(&self, inner: &mut CacheInner) -> bool {
        let Some((_, key)) = inner.lru.iter().next() else {
            return false;
        };
        let key = key.clone();
        let Some(rec) = inner.records.get(&key) else {
            return false;
        };
        let rec = Arc::clone(rec);
        if is_busy(&rec) {
            debug!(lfn = %key, "LRU victim is busy, giving up on LRU purge");
            return false;
        }
        self.flush_dirty(&rec);
        inner.remove(&key);
        true
    }

    /// Age sweep over every entry. Never purges a record with work in
    /// flight, however old; that is logged as a possibly stuck backend.
    fn purge_expired_locked(&self, inner: &mut CacheInner, now: u64) {
        let mut victims = Vec::new();
        for (key, rec) in &inner.records {
            let st = rec.lock();
            let age = now.saturating_sub(st.last_upd_time);
            let busy = st.is_pinned()
                || [Aspect::Stat, Aspect::Locations, Aspect::Items]
                    .into_iter()
                    .any(|a| st.derived(a) == InfoStatus::InProgress);
            if busy {
                if age > self.ttl {
                    warn!(lfn = %key, age, "expired record still has work in flight");
                }
                continue;
            }
            if age > self.maxttl {
                victims.push(key.clone());
                continue;
            }
            let limit = if st.info_status() == InfoStatus::NotFound {
                self.ttl_negative
            } else {
                self.ttl
            };
            if age > limit {
                victims.push(key.clone());
            }
        }
        for key in victims {
            if let Some(rec) = inner.records.get(&key) {
                self.flush_dirty(&Arc::clone(rec));
            }
            inner.remove(&key);
            debug!(lfn = %key, "purged expired record");
        }
    }

    /// Persist unsynced state to the external cache before the record
    /// leaves memory.
    fn flush_dirty(&self, rec: &Arc<FileRecord>) {
        let Some(ext) = self.ext.as_deref() else {
            return;
        };
        let (dirty_meta, dirty_items) = {
            let st = rec.lock();
            (st.dirty_meta, st.dirty_items)
        };
        let ttl = Duration::from_secs(self.ttl);
        if dirty_meta {
            match rec.encode_meta() {
                Ok(bytes) => ext.put_record(rec.name(), bytes, ttl),
                Err(e) => warn!(lfn = %rec.name(), error = %e, "failed to encode metadata"),
            }
        }
        if dirty_items {
            match rec.encode_children() {
                Ok(bytes) => ext.put_children(rec.name(), bytes, ttl),
                Err(e) => warn!(lfn = %rec.name(), error = %e, "failed to encode children"),
            }
        }
        let mut st = rec.lock();
        st.dirty_meta = false;
        st.dirty_items = false;
    }

    /// Flush one record's unsynced state without evicting it
    pub fn sync_record(&self, rec: &Arc<FileRecord>) {
        self.flush_dirty(rec);
    }
}

fn is_busy(rec: &Arc<FileRecord>) -> bool {
    let st = rec.lock();
    st.is_pinned()
        || [Aspect::Stat, Aspect::Locations, Aspect::Items]
            .into_iter()
            .any(|a| st.derived(a) == InfoStatus::InProgress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extcache::MemoryExtCache;
    use crate::record::StatInfo;

    fn small_cache(max_items: usize) -> RecordCache {
        RecordCache::new(
            &CacheConfig {
                max_items,
                item_ttl_secs: 100,
                item_maxttl_secs: 200,
                item_ttl_negative_secs: 10,
            },
            None,
        )
    }

    #[test]
    fn test_lru_evicts_oldest_first() {
        let cache = small_cache(2);
        cache.get_or_create("/a", true, false);
        cache.get_or_create("/b", true, false);
        cache.get_or_create("/c", true, false);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("/a").is_none());
        assert!(cache.get("/b").is_some());
        assert!(cache.get("/c").is_some());
    }

    #[test]
    fn test_lookup_refreshes_lru_position() {
        let cache = small_cache(2);
        cache.get_or_create("/a", true, false);
        cache.get_or_create("/b", true, false);
        cache.get_or_create("/a", true, false);
        cache.get_or_create("/c", true, false);
        assert!(cache.get("/a").is_some());
        assert!(cache.get("/b").is_none());
    }

    #[test]
    fn test_pending_record_is_never_evicted() {
        let cache = small_cache(1);
        let rec = cache.get_or_create("/a", true, false);
        rec.mark_pending(Aspect::Stat);
        cache.get_or_create("/b", true, false);
        // Over capacity rather than evicting in-flight work.
        assert_eq!(cache.len(), 2);
        assert!(cache.get("/a").is_some());
        rec.mark_done(Aspect::Stat);
    }

    #[test]
    fn test_pinned_record_is_never_evicted() {
        let cache = small_cache(1);
        let rec = cache.get_or_create("/a", true, false);
        rec.pin();
        cache.get_or_create("/b", true, false);
        assert!(cache.get("/a").is_some());
        rec.unpin();
    }

    #[test]
    fn test_negative_entries_expire_sooner() {
        let cache = small_cache(100);
        let pos = cache.get_or_create("/pos", true, false);
        pos.take_stat(&StatInfo::default(), 2000);
        let neg = cache.get_or_create("/neg", true, false);
        neg.lock().set_raw_status(Aspect::Stat, InfoStatus::NotFound);

        let now = unix_now();
        cache.tick(now + 50);
        assert!(cache.get("/pos").is_some());
        assert!(cache.get("/neg").is_none());
    }

    #[test]
    fn test_positive_entries_expire_at_ttl() {
        let cache = small_cache(100);
        let pos = cache.get_or_create("/pos", true, false);
        pos.take_stat(&StatInfo::default(), 2000);

        let now = unix_now();
        cache.tick(now + 101);
        assert!(cache.get("/pos").is_none());
    }

    #[test]
    fn test_expired_pending_record_survives_sweep() {
        let cache = small_cache(100);
        let rec = cache.get_or_create("/stuck", false, false);
        rec.mark_pending(Aspect::Locations);

        let now = unix_now();
        cache.tick(now + 10_000);
        assert!(cache.get("/stuck").is_some());
        rec.mark_done(Aspect::Locations);
    }

    #[test]
    fn test_eviction_flushes_to_external_cache() {
        let ext: Arc<dyn ExtCache> = Arc::new(MemoryExtCache::new());
        let cache = RecordCache::new(
            &CacheConfig {
                max_items: 1,
                item_ttl_secs: 100,
                item_maxttl_secs: 200,
                item_ttl_negative_secs: 10,
            },
            Some(Arc::clone(&ext)),
        );

        let rec = cache.get_or_create("/a", true, false);
        rec.take_stat(
            &StatInfo {
                size: 77,
                mode: 0o644,
                ..StatInfo::default()
            },
            2000,
        );
        // Evict /a, then fault it back in from the shared cache.
        cache.get_or_create("/b", true, false);
        assert!(cache.get("/a").is_none());
        cache.get_or_create("/c", true, false);
        let back = cache.get_or_create("/a", true, false);
        assert_eq!(back.lock().size, 77);
        assert_eq!(back.lock().stat_status, InfoStatus::Ok);
    }

    #[test]
    fn test_wipe_removes_record() {
        let cache = small_cache(100);
        cache.get_or_create("/a", true, false);
        cache.wipe("/a");
        assert!(cache.get("/a").is_none());
    }

    #[test]
    fn test_add_child_to_parent() {
        let cache = small_cache(100);
        cache.add_child_to_parent("/dir/f1", 2000);
        let parent = cache.get("/dir").expect("parent created");
        let st = parent.lock();
        assert_eq!(st.subitems.len(), 1);
        assert_eq!(st.subitems.iter().next().unwrap().name, "f1");
    }
}
