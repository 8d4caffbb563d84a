//! Per-path metadata record and its completion state machine
//!
//! A [`FileRecord`] holds everything the federation knows about one
//! logical path: stat payload, replica locations, and directory items.
//! Each of those three aspects is tracked independently with a raw
//! status plus a pending counter counting the backends still working
//! on it. Any number of dispatcher workers mutate the record
//! concurrently under its own mutex; waiters block on the record's
//! condvar, which is broadcast on every completion.

use metafed_common::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// Seconds since the unix epoch
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One independently tracked facet of a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aspect {
    Stat,
    Locations,
    Items,
}

/// Knowledge state of one aspect
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoStatus {
    /// Never attempted, nothing known
    #[default]
    NoInfo,
    /// At least one backend is still working
    InProgress,
    /// At least one backend answered positively
    Ok,
    /// Every backend denied existence, or the wait deadline elapsed empty
    NotFound,
    /// Structural failure distinct from absence (e.g. oversized listing)
    Error,
}

/// One listing entry of a directory record, deduplicated by name
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubItem {
    pub name: String,
    /// Free-form location tag
    pub location: String,
}

impl PartialEq for SubItem {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for SubItem {}
impl PartialOrd for SubItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SubItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

/// Outcome of one backend's view of a replica
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    #[default]
    Available,
    Unreachable,
    PermissionDenied,
    Deleted,
}

/// One concrete location realizing a logical path, deduplicated by
/// canonical name
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Replica {
    /// Canonical replica URL
    pub name: String,
    /// Id of the backend that produced it
    pub backend_id: usize,
    pub status: ReplicaStatus,
    /// Geo coordinates, when a filter assigned them
    pub latitude: f64,
    pub longitude: f64,
    /// Human-readable location tag
    pub location: String,
}

/// Stat payload delivered by a protocol client
#[derive(Clone, Debug, Default)]
pub struct StatInfo {
    pub size: u64,
    pub mode: u32,
    /// Advertised number of children, used to refuse oversized listings
    pub nlink: u64,
    pub owner: String,
    pub group: String,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// Unix directory bit, mirroring `S_IFDIR`
pub const MODE_DIR: u32 = 0o040_000;

/// Mutable state of a record, guarded by the record's mutex
#[derive(Debug, Default)]
pub struct RecordState {
    pub stat_status: InfoStatus,
    pub locations_status: InfoStatus,
    pub items_status: InfoStatus,

    pending_stat: u32,
    pending_locations: u32,
    pending_items: u32,

    pub size: u64,
    pub mode: u32,
    pub owner: String,
    pub group: String,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,

    /// Last time the payload was actually updated; drives the TTL clock
    pub last_upd_time: u64,
    /// Last time anything referenced this record
    pub last_ref_time: u64,

    pub subitems: BTreeSet<SubItem>,
    pub replicas: BTreeMap<String, Replica>,

    /// Payload changed since the last external-cache push
    pub dirty_meta: bool,
    /// Child/replica sets changed since the last external-cache push
    pub dirty_items: bool,

    pin_count: u32,
}

impl RecordState {
    fn pending(&self, aspect: Aspect) -> u32 {
        match aspect {
            Aspect::Stat => self.pending_stat,
            Aspect::Locations => self.pending_locations,
            Aspect::Items => self.pending_items,
        }
    }

    fn pending_mut(&mut self, aspect: Aspect) -> &mut u32 {
        match aspect {
            Aspect::Stat => &mut self.pending_stat,
            Aspect::Locations => &mut self.pending_locations,
            Aspect::Items => &mut self.pending_items,
        }
    }

    pub fn raw_status(&self, aspect: Aspect) -> InfoStatus {
        match aspect {
            Aspect::Stat => self.stat_status,
            Aspect::Locations => self.locations_status,
            Aspect::Items => self.items_status,
        }
    }

    pub fn set_raw_status(&mut self, aspect: Aspect, status: InfoStatus) {
        match aspect {
            Aspect::Stat => self.stat_status = status,
            Aspect::Locations => self.locations_status = status,
            Aspect::Items => self.items_status = status,
        }
    }

    /// Derived aspect status: pending backends dominate, then a positive
    /// answer, then whatever the raw status says.
    #[must_use]
    pub fn derived(&self, aspect: Aspect) -> InfoStatus {
        if self.pending(aspect) > 0 {
            return InfoStatus::InProgress;
        }
        let raw = self.raw_status(aspect);
        if raw == InfoStatus::Ok {
            return InfoStatus::Ok;
        }
        raw
    }

    /// Aggregate status over all aspects, used by eviction
    #[must_use]
    pub fn info_status(&self) -> InfoStatus {
        if self.pending_stat > 0 || self.pending_locations > 0 || self.pending_items > 0 {
            return InfoStatus::InProgress;
        }
        if self.stat_status == InfoStatus::Ok
            || self.locations_status == InfoStatus::Ok
            || self.items_status == InfoStatus::Ok
        {
            return InfoStatus::Ok;
        }
        if self.stat_status == InfoStatus::NotFound {
            return InfoStatus::NotFound;
        }
        InfoStatus::NoInfo
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.mode & MODE_DIR != 0
    }
}

/// The per-path metadata entity. Shared as `Arc<FileRecord>` between
/// the cache, the federator, and any number of dispatcher workers.
pub struct FileRecord {
    name: String,
    state: Mutex<RecordState>,
    cond: Condvar,
}

impl std::fmt::Debug for FileRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRecord").field("name", &self.name).finish_non_exhaustive()
    }
}

impl FileRecord {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = unix_now();
        let state = RecordState {
            last_upd_time: now,
            last_ref_time: now,
            ..RecordState::default()
        };
        Self {
            name: name.into(),
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the record state. Callers must only hold the guard to copy
    /// fields in or out, never across backend I/O.
    pub fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock()
    }

    /// One more backend started working on `aspect`
    pub fn mark_pending(&self, aspect: Aspect) {
        let mut st = self.state.lock();
        *st.pending_mut(aspect) += 1;
    }

    /// One backend finished working on `aspect`; wakes every waiter.
    /// Decrementing a zero counter is a logic error, reported and ignored.
    pub fn mark_done(&self, aspect: Aspect) {
        let mut st = self.state.lock();
        let ctr = st.pending_mut(aspect);
        if *ctr > 0 {
            *ctr -= 1;
        } else {
            error!(record = %self.name, ?aspect, "record was not marked pending");
        }
        drop(st);
        self.cond.notify_all();
    }

    /// Wake every waiter after an out-of-band state change
    pub fn signal_update(&self) {
        self.cond.notify_all();
    }

    /// Wait until the derived status of `aspect` leaves `InProgress` or
    /// the timeout elapses. The condvar is waited in short slices so a
    /// missed signal can never stall past the deadline. On timeout with
    /// nothing recorded, silence is treated as absence: a raw `NoInfo`
    /// is forced to `NotFound`.
    pub fn wait_for(&self, aspect: Aspect, timeout: Duration) -> InfoStatus {
        let deadline = Instant::now() + timeout;
        let slice = Duration::from_secs(1).min(timeout.max(Duration::from_millis(10)));
        let mut st = self.state.lock();

        while st.derived(aspect) == InfoStatus::InProgress {
            self.cond.wait_for(&mut st, slice);
            if Instant::now() >= deadline {
                debug!(record = %self.name, ?aspect, "wait timed out");
                break;
            }
        }

        if st.derived(aspect) == InfoStatus::InProgress {
            // Timed out with workers still pending. The caller gets
            // whatever was recorded so far; total silence is absence.
            if st.raw_status(aspect) == InfoStatus::NoInfo {
                st.set_raw_status(aspect, InfoStatus::NotFound);
            }
            return st.raw_status(aspect);
        }
        st.derived(aspect)
    }

    /// Merge a positive stat answer. Scalars are last-writer-wins,
    /// timestamps monotone. A link count past the listing cap marks the
    /// items aspect as a structural error instead of truncating.
    pub fn take_stat(&self, info: &StatInfo, max_listing_items: usize) {
        let mut st = self.state.lock();
        st.size = info.size;
        st.mode = info.mode;
        if !info.owner.is_empty() {
            st.owner = info.owner.clone();
        }
        if !info.group.is_empty() {
            st.group = info.group.clone();
        }
        if info.atime > st.atime {
            st.atime = info.atime;
        }
        if info.mtime > st.mtime {
            st.mtime = info.mtime;
        }
        if info.ctime > st.ctime {
            st.ctime = info.ctime;
        }
        st.stat_status = InfoStatus::Ok;
        st.last_upd_time = unix_now();
        st.dirty_meta = true;

        if info.nlink as usize > max_listing_items {
            info!(record = %self.name, nlink = info.nlink, "marking record as non listable");
            st.subitems.clear();
            st.items_status = InfoStatus::Error;
        }
    }

    /// Insert a listing entry; sets the items aspect to `Error` when the
    /// merged set would exceed the cap.
    pub fn add_child(&self, item: SubItem, max_listing_items: usize) {
        let mut st = self.state.lock();
        if st.items_status == InfoStatus::Error {
            return;
        }
        st.subitems.insert(item);
        st.dirty_items = true;
        st.last_upd_time = unix_now();
        if st.subitems.len() > max_listing_items {
            info!(record = %self.name, cap = max_listing_items, "listing exceeds cap");
            st.subitems.clear();
            st.items_status = InfoStatus::Error;
        }
    }

    /// Insert a replica, deduplicated by canonical name. Sets are merged
    /// monotonically; an existing entry is never overwritten.
    pub fn add_replica(&self, replica: Replica) {
        let mut st = self.state.lock();
        st.replicas.entry(replica.name.clone()).or_insert(replica);
        st.locations_status = InfoStatus::Ok;
        st.dirty_items = true;
        st.last_upd_time = unix_now();
    }

    /// Copy out the replica set
    #[must_use]
    pub fn replica_list(&self) -> Vec<Replica> {
        self.state.lock().replicas.values().cloned().collect()
    }

    /// Note a reference without changing the TTL clock
    pub fn touch(&self) {
        self.state.lock().last_ref_time = unix_now();
    }

    /// Defer eviction while a consumer iterates the child set
    pub fn pin(&self) {
        self.state.lock().pin_count += 1;
    }

    pub fn unpin(&self) {
        let mut st = self.state.lock();
        if st.pin_count > 0 {
            st.pin_count -= 1;
        } else {
            error!(record = %self.name, "unpin without matching pin");
        }
    }

    /// Full reset, used when a write invalidates previous knowledge
    pub fn set_to_no_info(&self) {
        let mut st = self.state.lock();
        st.size = 0;
        st.mode = 0;
        st.atime = 0;
        st.mtime = 0;
        st.ctime = 0;
        st.subitems.clear();
        st.replicas.clear();
        st.stat_status = InfoStatus::NoInfo;
        st.locations_status = InfoStatus::NoInfo;
        st.items_status = InfoStatus::NoInfo;
        st.dirty_meta = false;
        st.dirty_items = false;
    }

    /// Encode the metadata payload for the external cache
    pub fn encode_meta(&self) -> Result<Vec<u8>> {
        let st = self.state.lock();
        let snap = MetaSnapshot {
            stat_status: st.stat_status,
            size: st.size,
            mode: st.mode,
            owner: st.owner.clone(),
            group: st.group.clone(),
            atime: st.atime,
            mtime: st.mtime,
            ctime: st.ctime,
            last_upd_time: st.last_upd_time,
        };
        drop(st);
        bincode::serialize(&snap).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Merge a metadata payload fetched from the external cache
    pub fn decode_meta(&self, bytes: &[u8]) -> Result<()> {
        let snap: MetaSnapshot =
            bincode::deserialize(bytes).map_err(|e| Error::Decoding(e.to_string()))?;
        let mut st = self.state.lock();
        st.stat_status = snap.stat_status;
        st.size = snap.size;
        st.mode = snap.mode;
        st.owner = snap.owner;
        st.group = snap.group;
        st.atime = snap.atime;
        st.mtime = snap.mtime;
        st.ctime = snap.ctime;
        st.last_upd_time = snap.last_upd_time;
        st.dirty_meta = false;
        Ok(())
    }

    /// Encode the child/replica sets for the external cache
    pub fn encode_children(&self) -> Result<Vec<u8>> {
        let st = self.state.lock();
        let snap = ChildrenSnapshot {
            items_status: st.items_status,
            locations_status: st.locations_status,
            subitems: st.subitems.iter().cloned().collect(),
            replicas: st.replicas.values().cloned().collect(),
        };
        drop(st);
        bincode::serialize(&snap).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Merge child/replica sets fetched from the external cache
    pub fn decode_children(&self, bytes: &[u8]) -> Result<()> {
        let snap: ChildrenSnapshot =
            bincode::deserialize(bytes).map_err(|e| Error::Decoding(e.to_string()))?;
        let mut st = self.state.lock();
        st.items_status = snap.items_status;
        st.locations_status = snap.locations_status;
        for it in snap.subitems {
            st.subitems.insert(it);
        }
        for rep in snap.replicas {
            st.replicas.entry(rep.name.clone()).or_insert(rep);
        }
        st.dirty_items = false;
        Ok(())
    }
}

/// Lossless wire form of the stat payload
#[derive(Serialize, Deserialize)]
struct MetaSnapshot {
    stat_status: InfoStatus,
    size: u64,
    mode: u32,
    owner: String,
    group: String,
    atime: u64,
    mtime: u64,
    ctime: u64,
    last_upd_time: u64,
}

/// Lossless wire form of the child/replica sets
#[derive(Serialize, Deserialize)]
struct ChildrenSnapshot {
    items_status: InfoStatus,
    locations_status: InfoStatus,
    subitems: Vec<SubItem>,
    replicas: Vec<Replica>,
}
