//! Request orchestration across the backend federation
//!
//! Read requests (stat, locate, list) follow one shape: normalize the
//! path, fault the record in, trigger every eligible backend if nothing
//! is known yet, wait on the record up to the configured timeout, then
//! finalize. Write-path operations (new-location, remove) instead fan
//! out synchronously and wait on a scatter-gather completion counter
//! with its own timeout.

use crate::backend::ClientRegistry;
use crate::cache::RecordCache;
use crate::dispatch::BackendDispatcher;
use crate::extcache::{ExtCache, MemoryExtCache};
use crate::health::EndpointState;
use crate::record::{
    unix_now, Aspect, FileRecord, InfoStatus, Replica, ReplicaStatus,
};
use crate::replica::{ClientInfo, GeoSorter, ReplicaFilter, ReplicaPipeline};
use metafed_common::config::Config;
use metafed_common::{path, Error, Result};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which capability a read request needs from a backend; write-path
/// eligibility is computed separately.
#[derive(Clone, Copy, Debug)]
enum Capability {
    Read,
    List,
}

/// Completion counter for write-path fan-out. Each dispatched backend
/// reports exactly once; the waiter is released when the counter
/// reaches zero or its own deadline passes, whichever comes first.
pub struct GatherHandler {
    state: Mutex<GatherState>,
    cond: Condvar,
}

#[derive(Default)]
struct GatherState {
    remaining: usize,
    results: Vec<Replica>,
    denied: bool,
}

impl GatherHandler {
    #[must_use]
    pub fn new(remaining: usize) -> Self {
        Self {
            state: Mutex::new(GatherState {
                remaining,
                ..GatherState::default()
            }),
            cond: Condvar::new(),
        }
    }

    /// One backend reporting in. `denied` marks a permission failure
    /// that must fail the whole operation.
    pub fn complete(&self, results: Vec<Replica>, denied: bool) {
        let mut st = self.state.lock();
        st.results.extend(results);
        st.denied |= denied;
        st.remaining = st.remaining.saturating_sub(1);
        if st.remaining == 0 {
            self.cond.notify_all();
        }
    }

    /// Wait for every backend or the deadline; returns whatever was
    /// gathered either way, plus the permission verdict.
    pub fn wait(&self, timeout: Duration) -> (Vec<Replica>, bool) {
        let deadline = std::time::Instant::now() + timeout;
        let mut st = self.state.lock();
        while st.remaining > 0 {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            if left.is_zero() {
                debug!(remaining = st.remaining, "gather wait timed out");
                break;
            }
            self.cond.wait_for(&mut st, left.min(Duration::from_secs(1)));
        }
        (std::mem::take(&mut st.results), st.denied)
    }
}

/// Point-in-time federation summary for status reporting
#[derive(Debug, Serialize)]
pub struct FederationStatus {
    pub cache_items: usize,
    pub backends: Vec<BackendStatus>,
}

#[derive(Debug, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub state: EndpointState,
    pub ok: bool,
    pub queued: usize,
}

pub struct Federator {
    cfg: Config,
    cache: Arc<RecordCache>,
    backends: Vec<Arc<BackendDispatcher>>,
    pipeline: ReplicaPipeline,
    ext: Arc<dyn ExtCache>,
    shutdown: Arc<AtomicBool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Federator {
    /// Build the federation from configuration, resolving each backend
    /// kind through the registry.
    pub fn new(cfg: Config, registry: &ClientRegistry) -> Result<Self> {
        let mut clients = Vec::with_capacity(cfg.backends.len());
        for bcfg in &cfg.backends {
            clients.push(registry.build(bcfg)?);
        }
        Ok(Self::from_parts(cfg, clients, None))
    }

    /// Assemble from pre-built protocol clients, one per configured
    /// backend, in order. The second-level cache is injectable so a
    /// shared external store can back several federation instances;
    /// `None` falls back to an in-process cache.
    #[must_use]
    pub fn from_parts(
        cfg: Config,
        clients: Vec<Arc<dyn crate::backend::ProtocolClient>>,
        ext: Option<Arc<dyn ExtCache>>,
    ) -> Self {
        let ext: Arc<dyn ExtCache> = ext.unwrap_or_else(|| Arc::new(MemoryExtCache::new()));
        let cache = Arc::new(RecordCache::new(&cfg.cache, Some(Arc::clone(&ext))));

        let backends: Vec<Arc<BackendDispatcher>> = cfg
            .backends
            .iter()
            .zip(clients)
            .enumerate()
            .map(|(id, (bcfg, client))| {
                let desc = crate::backend::BackendDescriptor::from_config(id, bcfg);
                Arc::new(BackendDispatcher::new(
                    desc,
                    client,
                    Some(Arc::clone(&ext)),
                    cfg.global.max_listing_items,
                ))
            })
            .collect();

        let mut pipeline = ReplicaPipeline::new();
        pipeline.push(Arc::new(GeoSorter::new(cfg.global.geo_fuzz_km)) as Arc<dyn ReplicaFilter>);

        Self {
            cfg,
            cache,
            backends,
            pipeline,
            ext,
            shutdown: Arc::new(AtomicBool::new(false)),
            ticker: Mutex::new(None),
        }
    }

    /// Start workers and the maintenance ticker. Backends whose results
    /// require cross-validation are wired to probe the slave backends.
    pub fn start(&self) {
        let slaves: Vec<Arc<BackendDispatcher>> = self
            .backends
            .iter()
            .filter(|d| d.descriptor().slave)
            .cloned()
            .collect();
        for d in &self.backends {
            if d.descriptor().replica_xlator && !slaves.is_empty() {
                let slaves = slaves.clone();
                d.set_cross_validator(Arc::new(move |rec, url| {
                    for s in &slaves {
                        if s.is_ok() {
                            s.do_check_replica(rec, url);
                        }
                    }
                }));
            }
            d.start();
        }

        let cache = Arc::clone(&self.cache);
        let backends = self.backends.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let tick = Duration::from_secs(self.cfg.global.tick_secs.max(1));
        let handle = std::thread::Builder::new()
            .name("metafed-ticker".to_string())
            .spawn(move || {
                let slice = Duration::from_millis(200);
                let mut next = std::time::Instant::now() + tick;
                while !shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(slice);
                    if std::time::Instant::now() < next {
                        continue;
                    }
                    next = std::time::Instant::now() + tick;
                    let now = unix_now();
                    cache.tick(now);
                    for d in &backends {
                        d.tick(now);
                    }
                }
            });
        match handle {
            Ok(h) => *self.ticker.lock() = Some(h),
            Err(e) => warn!(error = %e, "failed to start maintenance ticker"),
        }
        info!(backends = self.backends.len(), "federation started");
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.ticker.lock().take() {
            if h.join().is_err() {
                warn!("ticker thread panicked");
            }
        }
        for d in &self.backends {
            d.stop();
        }
        info!("federation stopped");
    }

    #[must_use]
    pub fn status(&self) -> FederationStatus {
        FederationStatus {
            cache_items: self.cache.len(),
            backends: self
                .backends
                .iter()
                .map(|d| BackendStatus {
                    name: d.descriptor().name.clone(),
                    state: d.monitor().status().state,
                    ok: d.is_ok(),
                    queued: d.queue_len(),
                })
                .collect(),
        }
    }

    /// Aggregate stat across the federation.
    pub fn stat(&self, lfn: &str) -> (Arc<FileRecord>, InfoStatus) {
        let lfn = self.rewrite(lfn);
        let rec = self.cache.get_or_create(&lfn, true, false);

        if rec.lock().derived(Aspect::Stat) == InfoStatus::NoInfo {
            let n = self.fan_out(&rec, Capability::Read, BackendDispatcher::do_stat);
            debug!(lfn = %lfn, backends = n, "stat fan-out");
        }
        rec.wait_for(Aspect::Stat, self.wait_timeout());
        let status = Self::finalize(&rec, Aspect::Stat);

        if status == InfoStatus::Ok && self.cfg.global.add_child_on_stat {
            self.cache
                .add_child_to_parent(&lfn, self.cfg.global.max_listing_items);
        }
        self.cache.sync_record(&rec);
        (rec, status)
    }

    /// Aggregate locate: every readable backend is asked for replicas,
    /// then the merged set runs through the selection pipeline.
    pub fn locate(&self, lfn: &str, client: &ClientInfo) -> (Arc<FileRecord>, InfoStatus, Vec<Replica>) {
        let lfn = self.rewrite(lfn);
        let rec = self.cache.get_or_create(&lfn, false, true);

        if rec.lock().derived(Aspect::Locations) == InfoStatus::NoInfo {
            let n = self.fan_out(&rec, Capability::Read, BackendDispatcher::do_locate);
            debug!(lfn = %lfn, backends = n, "locate fan-out");
        }
        rec.wait_for(Aspect::Locations, self.wait_timeout());
        let status = Self::finalize(&rec, Aspect::Locations);

        let mut replicas = rec.replica_list();
        for r in &mut replicas {
            self.pipeline.on_new_replica(r);
        }
        self.pipeline
            .run(&mut replicas, client, &|id| self.backend_ok(id));
        self.cache.sync_record(&rec);
        (rec, status, replicas)
    }

    /// Aggregate directory listing. The items aspect finalizes to `Ok`
    /// when any children were gathered even if no backend claimed the
    /// whole listing.
    pub fn list(&self, lfn: &str) -> (Arc<FileRecord>, InfoStatus) {
        let lfn = self.rewrite(lfn);
        let rec = self.cache.get_or_create(&lfn, false, true);

        if rec.lock().derived(Aspect::Items) == InfoStatus::NoInfo {
            let n = self.fan_out(&rec, Capability::List, BackendDispatcher::do_list);
            debug!(lfn = %lfn, backends = n, "list fan-out");
        }
        rec.wait_for(Aspect::Items, self.wait_timeout());
        let status = {
            let mut st = rec.lock();
            if st.raw_status(Aspect::Items) == InfoStatus::NoInfo {
                let terminal = if st.subitems.is_empty() {
                    InfoStatus::NotFound
                } else {
                    InfoStatus::Ok
                };
                st.set_raw_status(Aspect::Items, terminal);
            }
            let derived = st.derived(Aspect::Items);
            if derived == InfoStatus::InProgress {
                st.raw_status(Aspect::Items)
            } else {
                derived
            }
        };

        if status == InfoStatus::Ok && self.cfg.global.stat_subdirs {
            self.prefetch_child_stats(&lfn, &rec);
        }
        self.cache.sync_record(&rec);
        (rec, status)
    }

    /// Ask every writable backend for a place to create `lfn`. The
    /// first usable candidates, pipeline-ordered, are returned.
    pub fn find_new_location(
        &self,
        lfn: &str,
        size: u64,
        client: &ClientInfo,
    ) -> Result<Vec<Replica>> {
        let lfn = self.rewrite(lfn);
        let targets = self.write_targets();
        if targets.is_empty() {
            return Err(Error::NoBackendAvailable);
        }

        let gather = Arc::new(GatherHandler::new(targets.len()));
        for d in targets {
            let gather = Arc::clone(&gather);
            let lfn = lfn.clone();
            std::thread::spawn(move || {
                let Some(pfn) = d.descriptor().xlation.xlate(&lfn) else {
                    gather.complete(Vec::new(), false);
                    return;
                };
                match d.client().new_location(&pfn, size) {
                    Ok(mut rep) => {
                        rep.backend_id = d.descriptor().id;
                        gather.complete(vec![rep], false);
                    }
                    Err(e) => {
                        let denied =
                            matches!(e, crate::backend::ClientError::PermissionDenied);
                        gather.complete(Vec::new(), denied);
                    }
                }
            });
        }

        let (mut results, denied) = gather.wait(self.wait_timeout());
        if denied {
            return Err(Error::PermissionDenied(lfn));
        }
        results.retain(|r| r.status == ReplicaStatus::Available);
        for r in &mut results {
            self.pipeline.on_new_replica(r);
        }
        self.pipeline
            .run(&mut results, client, &|id| self.backend_ok(id));
        if results.is_empty() {
            return Err(Error::NoBackendAvailable);
        }
        Ok(results)
    }

    /// Remove `lfn` from every writable backend holding it. Returns the
    /// replicas that were removed; local knowledge of the path is wiped.
    pub fn remove(&self, lfn: &str) -> Result<Vec<Replica>> {
        let lfn = self.rewrite(lfn);
        let targets = self.write_targets();
        if targets.is_empty() {
            return Err(Error::NoBackendAvailable);
        }

        let gather = Arc::new(GatherHandler::new(targets.len()));
        for d in targets {
            let gather = Arc::clone(&gather);
            let lfn = lfn.clone();
            std::thread::spawn(move || {
                let Some(pfn) = d.descriptor().xlation.xlate(&lfn) else {
                    gather.complete(Vec::new(), false);
                    return;
                };
                match d.client().delete(&pfn) {
                    Ok(mut reps) => {
                        for r in &mut reps {
                            r.backend_id = d.descriptor().id;
                        }
                        gather.complete(reps, false);
                    }
                    Err(e) => {
                        let denied =
                            matches!(e, crate::backend::ClientError::PermissionDenied);
                        gather.complete(Vec::new(), denied);
                    }
                }
            });
        }

        let (mut removed, denied) = gather.wait(self.wait_timeout());
        self.cache.wipe(&lfn);
        if denied {
            return Err(Error::PermissionDenied(lfn));
        }
        removed.retain(|r| r.status == ReplicaStatus::Available);
        if removed.is_empty() {
            return Err(Error::FileNotFound(lfn));
        }
        Ok(removed)
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    #[must_use]
    pub fn ext_cache(&self) -> &Arc<dyn ExtCache> {
        &self.ext
    }

    fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.global.wait_timeout_secs)
    }

    fn backend_ok(&self, id: usize) -> bool {
        self.backends.get(id).is_some_and(|d| d.is_ok())
    }

    /// Trigger `op` on every backend fit for the request; returns how
    /// many were dispatched.
    fn fan_out(
        &self,
        rec: &Arc<FileRecord>,
        cap: Capability,
        op: fn(&BackendDispatcher, &Arc<FileRecord>),
    ) -> usize {
        let mut n = 0;
        for d in &self.backends {
            let desc = d.descriptor();
            let has_cap = match cap {
                Capability::Read => desc.readable,
                Capability::List => desc.listable,
            };
            if desc.slave || !has_cap || !d.is_ok() {
                continue;
            }
            op(d, rec);
            n += 1;
        }
        n
    }

    fn write_targets(&self) -> Vec<Arc<BackendDispatcher>> {
        self.backends
            .iter()
            .filter(|d| {
                let desc = d.descriptor();
                desc.writable && !desc.slave && d.is_ok()
            })
            .cloned()
            .collect()
    }

    /// After the wait, silence becomes absence. Backends still working
    /// past the deadline no longer count; the caller gets whatever raw
    /// answer stands now.
    fn finalize(rec: &Arc<FileRecord>, aspect: Aspect) -> InfoStatus {
        let mut st = rec.lock();
        if st.raw_status(aspect) == InfoStatus::NoInfo {
            st.set_raw_status(aspect, InfoStatus::NotFound);
        }
        let derived = st.derived(aspect);
        if derived == InfoStatus::InProgress {
            st.raw_status(aspect)
        } else {
            derived
        }
    }

    /// Warm per-child stat records so the stats that typically follow a
    /// listing are already in flight.
    fn prefetch_child_stats(&self, lfn: &str, rec: &Arc<FileRecord>) {
        let children: Vec<String> = {
            let st = rec.lock();
            st.subitems.iter().map(|s| s.name.clone()).collect()
        };
        for child in children {
            let child_lfn = path::join(lfn, &child);
            let child_rec = self.cache.get_or_create(&child_lfn, true, false);
            if child_rec.lock().derived(Aspect::Stat) == InfoStatus::NoInfo {
                self.fan_out(&child_rec, Capability::Read, BackendDispatcher::do_stat);
            }
        }
    }

    /// Path normalization plus the global prefix rewrite, applied before
    /// any backend sees the name.
    fn rewrite(&self, lfn: &str) -> String {
        let trimmed = path::trim_path(lfn);
        let pfx = &self.cfg.global.n2n_pfx;
        if pfx.is_empty() {
            return trimmed;
        }
        if trimmed == *pfx {
            return path::trim_path(&self.cfg.global.n2n_newpfx);
        }
        if path::is_ancestor_of(pfx, &trimmed) {
            let rest = &trimmed[pfx.len()..];
            return format!("{}{rest}", self.cfg.global.n2n_newpfx.trim_end_matches('/'));
        }
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ProtocolClient, StaticClient};
    use metafed_common::config::{BackendConfig, CacheConfig, GlobalConfig};

    fn backend_cfg(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            kind: "static".to_string(),
            workers: 2,
            readable: true,
            writable: true,
            listable: true,
            slave: false,
            replica_xlator: false,
            base_url: String::new(),
            check_interval_secs: 60,
            max_latency_ms: 5000,
            stabilization_secs: 0,
            xlat: vec![],
            xlat_hashed: vec![],
        }
    }

    fn test_config(n_backends: usize) -> Config {
        Config {
            global: GlobalConfig {
                wait_timeout_secs: 5,
                tick_secs: 3600,
                max_listing_items: 2000,
                stat_subdirs: false,
                add_child_on_stat: true,
                n2n_pfx: String::new(),
                n2n_newpfx: String::new(),
                geo_fuzz_km: 10.0,
            },
            cache: CacheConfig {
                max_items: 1000,
                item_ttl_secs: 3600,
                item_maxttl_secs: 7200,
                item_ttl_negative_secs: 10,
            },
            backends: (0..n_backends)
                .map(|i| backend_cfg(&format!("b{i}")))
                .collect(),
        }
    }

    fn started(cfg: Config, clients: Vec<Arc<dyn ProtocolClient>>) -> Federator {
        started_with_ext(cfg, clients, None)
    }

    fn started_with_ext(
        cfg: Config,
        clients: Vec<Arc<dyn ProtocolClient>>,
        ext: Option<Arc<dyn ExtCache>>,
    ) -> Federator {
        let fed = Federator::from_parts(cfg, clients, ext);
        fed.start();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !fed.backends.iter().all(|d| d.is_ok())
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        fed
    }

    #[test]
    fn test_stat_found_on_one_of_two_backends() {
        let c1 = Arc::new(StaticClient::new());
        let c2 = Arc::new(StaticClient::new());
        c2.add_file("/data/f1", 99, &[]);
        let fed = started(test_config(2), vec![c1, c2]);

        let (rec, status) = fed.stat("/data/f1");
        assert_eq!(status, InfoStatus::Ok);
        assert_eq!(rec.lock().size, 99);
        fed.stop();
    }

    #[test]
    fn test_positive_answer_wins_over_slow_backend() {
        let fast = Arc::new(StaticClient::new());
        fast.add_file("/data/f1", 42, &[]);
        let slow = Arc::new(StaticClient::new());
        let mut cfg = test_config(2);
        cfg.global.wait_timeout_secs = 1;
        let fed = started(cfg, vec![fast, slow.clone()]);
        slow.set_delay(Duration::from_secs(3));

        let begin = std::time::Instant::now();
        let (rec, status) = fed.stat("/data/f1");
        assert_eq!(status, InfoStatus::Ok);
        assert_eq!(rec.lock().size, 42);
        assert!(begin.elapsed() < Duration::from_secs(3));

        // The straggler's answer must not disturb the settled record.
        std::thread::sleep(Duration::from_millis(3200));
        assert_eq!(rec.lock().derived(Aspect::Stat), InfoStatus::Ok);
        fed.stop();
    }

    #[test]
    fn test_silent_federation_is_not_found_after_timeout() {
        let slow = Arc::new(StaticClient::new());
        let mut cfg = test_config(1);
        cfg.global.wait_timeout_secs = 1;
        let fed = started(cfg, vec![slow.clone()]);
        slow.set_delay(Duration::from_secs(3));

        let begin = std::time::Instant::now();
        let (_, status) = fed.stat("/data/unanswered");
        let waited = begin.elapsed();
        assert_eq!(status, InfoStatus::NotFound);
        assert!(waited >= Duration::from_millis(900));
        assert!(waited < Duration::from_secs(3));
        fed.stop();
    }

    #[test]
    fn test_injected_ext_cache_is_shared_between_instances() {
        let ext: Arc<dyn ExtCache> = Arc::new(MemoryExtCache::new());

        let c1 = Arc::new(StaticClient::new());
        c1.add_file("/data/f1", 42, &[]);
        let fed = started_with_ext(test_config(1), vec![c1], Some(Arc::clone(&ext)));
        let (_, status) = fed.stat("/data/f1");
        assert_eq!(status, InfoStatus::Ok);
        fed.stop();
        assert!(ext.get_record("/data/f1").is_some());

        // A second instance with an empty backend is served from the
        // shared cache alone.
        let empty = Arc::new(StaticClient::new());
        let fed2 = started_with_ext(test_config(1), vec![empty], Some(ext));
        let (rec, status) = fed2.stat("/data/f1");
        assert_eq!(status, InfoStatus::Ok);
        assert_eq!(rec.lock().size, 42);
        fed2.stop();
    }

    #[test]
    fn test_stat_unknown_path_is_not_found() {
        let c1 = Arc::new(StaticClient::new());
        let fed = started(test_config(1), vec![c1]);

        let (_, status) = fed.stat("/nowhere");
        assert_eq!(status, InfoStatus::NotFound);
        fed.stop();
    }

    #[test]
    fn test_stat_with_no_eligible_backend_is_not_found() {
        let mut cfg = test_config(1);
        cfg.backends[0].readable = false;
        let fed = started(cfg, vec![Arc::new(StaticClient::new())]);

        let (_, status) = fed.stat("/data/f1");
        assert_eq!(status, InfoStatus::NotFound);
        fed.stop();
    }

    #[test]
    fn test_list_merges_children_across_backends() {
        let c1 = Arc::new(StaticClient::new());
        c1.add_dir("/data");
        c1.add_file("/data/a", 1, &[]);
        let c2 = Arc::new(StaticClient::new());
        c2.add_dir("/data");
        c2.add_file("/data/b", 2, &[]);
        let fed = started(test_config(2), vec![c1, c2]);

        let (rec, status) = fed.list("/data");
        assert_eq!(status, InfoStatus::Ok);
        let names: Vec<String> = rec.lock().subitems.iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
        fed.stop();
    }

    #[test]
    fn test_locate_merges_and_filters_replicas() {
        let c1 = Arc::new(StaticClient::new());
        c1.add_file("/data/f1", 1, &["http://se1/f1"]);
        let c2 = Arc::new(StaticClient::new());
        c2.add_file("/data/f1", 1, &["http://se2/f1"]);
        let fed = started(test_config(2), vec![c1, c2]);

        let (_, status, replicas) = fed.locate("/data/f1", &ClientInfo::default());
        assert_eq!(status, InfoStatus::Ok);
        let mut names: Vec<&str> = replicas.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["http://se1/f1", "http://se2/f1"]);
        fed.stop();
    }

    #[test]
    fn test_positive_stat_feeds_parent_listing() {
        let c1 = Arc::new(StaticClient::new());
        c1.add_file("/data/f1", 7, &[]);
        let fed = started(test_config(1), vec![c1]);

        let (_, status) = fed.stat("/data/f1");
        assert_eq!(status, InfoStatus::Ok);
        let parent = fed.cache.get("/data").expect("parent record");
        assert!(parent.lock().subitems.iter().any(|s| s.name == "f1"));
        fed.stop();
    }

    #[test]
    fn test_find_new_location_returns_writable_candidate() {
        let c1 = Arc::new(StaticClient::new());
        let fed = started(test_config(1), vec![c1]);

        let reps = fed
            .find_new_location("/data/new", 1024, &ClientInfo::default())
            .expect("a candidate location");
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].name, "static:///data/new");
        fed.stop();
    }

    #[test]
    fn test_find_new_location_without_writable_backend_fails() {
        let mut cfg = test_config(1);
        cfg.backends[0].writable = false;
        let fed = started(cfg, vec![Arc::new(StaticClient::new())]);

        let err = fed
            .find_new_location("/data/new", 1, &ClientInfo::default())
            .unwrap_err();
        assert!(matches!(err, Error::NoBackendAvailable));
        fed.stop();
    }

    #[test]
    fn test_remove_wipes_cached_knowledge() {
        let c1 = Arc::new(StaticClient::new());
        c1.add_file("/data/f1", 1, &["http://se1/f1"]);
        let fed = started(test_config(1), vec![c1]);

        let (_, status) = fed.stat("/data/f1");
        assert_eq!(status, InfoStatus::Ok);

        let removed = fed.remove("/data/f1").expect("one removed replica");
        assert_eq!(removed.len(), 1);
        assert!(fed.cache.get("/data/f1").is_none());
        fed.stop();
    }

    #[test]
    fn test_remove_of_missing_path_is_not_found() {
        let fed = started(test_config(1), vec![Arc::new(StaticClient::new())]);
        let err = fed.remove("/nope").unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
        fed.stop();
    }

    #[test]
    fn test_global_prefix_rewrite() {
        let c1 = Arc::new(StaticClient::new());
        c1.add_file("/data/f1", 12, &[]);
        let mut cfg = test_config(1);
        cfg.global.n2n_pfx = "/fed".to_string();
        cfg.global.n2n_newpfx = "/data".to_string();
        let fed = started(cfg, vec![c1]);

        let (rec, status) = fed.stat("/fed/f1");
        assert_eq!(status, InfoStatus::Ok);
        assert_eq!(rec.name(), "/data/f1");
        assert_eq!(rec.lock().size, 12);
        fed.stop();
    }

    #[test]
    fn test_gather_handler_releases_on_completion() {
        let g = Arc::new(GatherHandler::new(2));
        let g2 = Arc::clone(&g);
        let h = std::thread::spawn(move || {
            g2.complete(vec![Replica::default()], false);
            g2.complete(vec![Replica::default()], false);
        });
        let (results, denied) = g.wait(Duration::from_secs(10));
        assert_eq!(results.len(), 2);
        assert!(!denied);
        h.join().unwrap();
    }

    #[test]
    fn test_gather_handler_times_out_with_partial_results() {
        let g = GatherHandler::new(2);
        g.complete(vec![Replica::default()], false);
        let start = std::time::Instant::now();
        let (results, _) = g.wait(Duration::from_millis(100));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_gather_handler_reports_denial() {
        let g = GatherHandler::new(1);
        g.complete(Vec::new(), true);
        let (_, denied) = g.wait(Duration::from_secs(1));
        assert!(denied);
    }
}
