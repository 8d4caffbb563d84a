//! Per-backend work dispatch
//!
//! Each backend owns a FIFO of work items and a fixed pool of worker
//! threads draining it. The public contract is asymmetric: `do_stat`,
//! `do_locate` and `do_list` mark the record pending and enqueue
//! before returning (so the caller can immediately wait on the
//! record), while `do_wait_*` block on the record's condvar with a
//! timeout. Workers never hold a record lock across a protocol call;
//! transport failures are absorbed here and surfaced to the record
//! only as absence.

use crate::backend::{BackendDescriptor, ClientError, ProtocolClient};
use crate::extcache::ExtCache;
use crate::health::{AvailabilityMonitor, EndpointState, EndpointStatus, TickAction};
use crate::record::{
    unix_now, Aspect, FileRecord, InfoStatus, Replica, ReplicaStatus, StatInfo, SubItem, MODE_DIR,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Operation kind of one queued work item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkOp {
    Stat,
    Locate,
    List,
    CheckReplica,
    HealthCheck,
    Nop,
}

impl WorkOp {
    fn aspect(self) -> Option<Aspect> {
        match self {
            Self::Stat => Some(Aspect::Stat),
            Self::Locate | Self::CheckReplica => Some(Aspect::Locations),
            Self::List => Some(Aspect::Items),
            Self::HealthCheck | Self::Nop => None,
        }
    }
}

/// One unit of backend work
pub struct WorkItem {
    /// Absent only for pure health checks
    pub record: Option<Arc<FileRecord>>,
    pub op: WorkOp,
    /// Replica URL for `CheckReplica`
    pub replica: Option<String>,
    /// Alternate name prefix overriding the translation chain
    pub alt_prefix: Option<String>,
}

struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    cond: Condvar,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, item: WorkItem) {
        self.items.lock().push_back(item);
        self.cond.notify_one();
    }

    /// Pop one item, waiting at most `timeout` so workers stay
    /// responsive to shutdown.
    fn pop(&self, timeout: Duration) -> Option<WorkItem> {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.cond.wait_for(&mut items, timeout);
        }
        items.pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

/// Callback routing a located replica to slave cross-validation
pub type CrossValidator = Arc<dyn Fn(&Arc<FileRecord>, &str) + Send + Sync>;

/// The generic async machinery owned by every backend: queue, worker
/// pool, availability monitor, and name translation. Protocol
/// specifics live behind the [`ProtocolClient`].
pub struct BackendDispatcher {
    desc: BackendDescriptor,
    client: Arc<dyn ProtocolClient>,
    monitor: AvailabilityMonitor,
    queue: WorkQueue,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
    ext: Option<Arc<dyn ExtCache>>,
    max_listing_items: usize,
    xvalidator: RwLock<Option<CrossValidator>>,
}

/// How long an idle worker sleeps between queue polls
const POLL_SLICE: Duration = Duration::from_millis(200);

impl BackendDispatcher {
    #[must_use]
    pub fn new(
        desc: BackendDescriptor,
        client: Arc<dyn ProtocolClient>,
        ext: Option<Arc<dyn ExtCache>>,
        max_listing_items: usize,
    ) -> Self {
        let monitor =
            AvailabilityMonitor::new(desc.name.clone(), desc.check_interval, desc.stabilization);
        Self {
            desc,
            client,
            monitor,
            queue: WorkQueue::new(),
            workers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            ext,
            max_listing_items,
            xvalidator: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.desc
    }

    #[must_use]
    pub fn monitor(&self) -> &AvailabilityMonitor {
        &self.monitor
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.monitor.is_ok()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Route located replicas through the federation's slave
    /// cross-validation instead of direct insertion. Set once at
    /// startup for `replica_xlator` backends.
    pub fn set_cross_validator(&self, v: CrossValidator) {
        *self.xvalidator.write() = Some(v);
    }

    /// Spawn the worker pool and seed an initial availability probe.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        info!(backend = %self.desc.name, n = self.desc.workers, "starting workers");
        for idx in 0..self.desc.workers {
            let me = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("{}-w{idx}", self.desc.name))
                .spawn(move || me.worker_loop(idx))
                .unwrap_or_else(|e| panic!("spawning worker for {}: {e}", self.desc.name));
            workers.push(handle);
        }
        drop(workers);
        self.queue.push(WorkItem {
            record: None,
            op: WorkOp::HealthCheck,
            replica: None,
            alt_prefix: None,
        });
    }

    /// Signal shutdown and join every worker.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.cond.notify_all();
        let mut workers = self.workers.lock();
        for h in workers.drain(..) {
            if h.join().is_err() {
                warn!(backend = %self.desc.name, "worker panicked");
            }
        }
    }

    /// Non-blocking: mark the record stat-pending and enqueue the work.
    pub fn do_stat(&self, record: &Arc<FileRecord>) {
        self.enqueue(record, WorkOp::Stat, None, None);
    }

    /// Non-blocking: mark the record locations-pending and enqueue.
    pub fn do_locate(&self, record: &Arc<FileRecord>) {
        self.enqueue(record, WorkOp::Locate, None, None);
    }

    /// Non-blocking: mark the record items-pending and enqueue.
    pub fn do_list(&self, record: &Arc<FileRecord>) {
        self.enqueue(record, WorkOp::List, None, None);
    }

    /// Non-blocking probe: does this backend know this exact replica?
    pub fn do_check_replica(&self, record: &Arc<FileRecord>, replica: &str) {
        self.enqueue(record, WorkOp::CheckReplica, Some(replica.to_string()), None);
    }

    pub fn do_wait_stat(&self, record: &FileRecord, timeout: Duration) -> InfoStatus {
        record.wait_for(Aspect::Stat, timeout)
    }

    pub fn do_wait_locate(&self, record: &FileRecord, timeout: Duration) -> InfoStatus {
        record.wait_for(Aspect::Locations, timeout)
    }

    pub fn do_wait_list(&self, record: &FileRecord, timeout: Duration) -> InfoStatus {
        record.wait_for(Aspect::Items, timeout)
    }

    /// Periodic maintenance: adopt/persist availability state and queue
    /// a probe when the status expired.
    pub fn tick(&self, now: u64) {
        let action = self.monitor.tick(now, self.ext.as_deref());
        if action == TickAction::ProbeDue {
            self.queue.push(WorkItem {
                record: None,
                op: WorkOp::HealthCheck,
                replica: None,
                alt_prefix: None,
            });
        }
    }

    fn enqueue(
        &self,
        record: &Arc<FileRecord>,
        op: WorkOp,
        replica: Option<String>,
        alt_prefix: Option<String>,
    ) {
        if let Some(aspect) = op.aspect() {
            record.mark_pending(aspect);
        }
        self.queue.push(WorkItem {
            record: Some(Arc::clone(record)),
            op,
            replica,
            alt_prefix,
        });
    }

    fn worker_loop(&self, idx: usize) {
        debug!(backend = %self.desc.name, idx, "worker up");
        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(item) = self.queue.pop(POLL_SLICE) else {
                continue;
            };
            match item.op {
                WorkOp::Nop => {}
                WorkOp::HealthCheck => self.run_health_check(),
                _ => self.run_search(&item),
            }
        }
        debug!(backend = %self.desc.name, idx, "worker down");
    }

    /// Execute one search item against the protocol client. Must leave
    /// the pending counter decremented exactly once on every path.
    fn run_search(&self, item: &WorkItem) {
        let Some(record) = item.record.as_ref() else {
            warn!(backend = %self.desc.name, "search item without record");
            return;
        };
        let Some(aspect) = item.op.aspect() else {
            return;
        };

        if item.op != WorkOp::CheckReplica && self.synthesize_parent(record, item.op) {
            record.mark_done(aspect);
            return;
        }

        // A disabled endpoint closes pending requests immediately.
        if !self.monitor.is_ok() {
            debug!(backend = %self.desc.name, record = %record.name(), "endpoint disabled, short-circuit");
            record.mark_done(aspect);
            return;
        }

        let logical = match item.op {
            WorkOp::CheckReplica => item.replica.clone().unwrap_or_default(),
            _ => record.name().to_string(),
        };
        let translated = match item.alt_prefix.as_ref() {
            Some(pfx) => Some(format!("{pfx}{logical}")),
            None => self.desc.xlation.xlate(&logical),
        };
        let Some(translated) = translated else {
            debug!(backend = %self.desc.name, lfn = %logical, "no translation rule, short-circuit");
            record.mark_done(aspect);
            return;
        };
        let target = format!("{}{translated}", self.desc.base_url);

        match item.op {
            WorkOp::Stat => match self.client.stat(&target) {
                Ok(st) => {
                    debug!(backend = %self.desc.name, lfn = %record.name(), size = st.size, "stat answer");
                    record.take_stat(&st, self.max_listing_items);
                    self.note_success();
                }
                Err(e) => self.note_failure(&e, record.name()),
            },
            WorkOp::Locate => match self.client.locate(&target) {
                Ok(urls) => {
                    for url in urls {
                        if self.desc.replica_xlator {
                            let v = self.xvalidator.read().clone();
                            if let Some(v) = v {
                                v(record, &url);
                                continue;
                            }
                        }
                        record.add_replica(Replica {
                            name: url,
                            backend_id: self.desc.id,
                            status: ReplicaStatus::Available,
                            ..Replica::default()
                        });
                    }
                    self.note_success();
                }
                Err(e) => self.note_failure(&e, record.name()),
            },
            WorkOp::List => match self.client.list(&target) {
                Ok(items) => {
                    for it in items {
                        record.add_child(it, self.max_listing_items);
                    }
                    let mut st = record.lock();
                    st.mode |= MODE_DIR;
                    if st.items_status != InfoStatus::Error {
                        st.items_status = InfoStatus::Ok;
                    }
                    drop(st);
                    self.note_success();
                }
                Err(e) => self.note_failure(&e, record.name()),
            },
            WorkOp::CheckReplica => match self.client.check_replica(&target) {
                Ok(true) => {
                    record.add_replica(Replica {
                        name: logical,
                        backend_id: self.desc.id,
                        status: ReplicaStatus::Available,
                        ..Replica::default()
                    });
                    self.note_success();
                }
                Ok(false) => {}
                Err(e) => self.note_failure(&e, record.name()),
            },
            WorkOp::HealthCheck | WorkOp::Nop => unreachable!(),
        }

        record.mark_done(aspect);
        record.touch();
    }

    /// Stat/List of an exact ancestor of a rewrite root never hits the
    /// endpoint: synthesize the one traversable child instead.
    fn synthesize_parent(&self, record: &Arc<FileRecord>, op: WorkOp) -> bool {
        let Some(child) = self.desc.xlation.synthesized_child(record.name()) else {
            return false;
        };
        match op {
            WorkOp::Stat => {
                record.take_stat(
                    &StatInfo {
                        mode: 0o755 | MODE_DIR,
                        mtime: unix_now(),
                        ..StatInfo::default()
                    },
                    self.max_listing_items,
                );
            }
            WorkOp::List => {
                record.add_child(
                    SubItem {
                        name: child,
                        location: String::new(),
                    },
                    self.max_listing_items,
                );
                let mut st = record.lock();
                st.mode |= MODE_DIR;
                if st.items_status != InfoStatus::Error {
                    st.items_status = InfoStatus::Ok;
                }
            }
            _ => return false,
        }
        debug!(backend = %self.desc.name, lfn = %record.name(), "synthesized rewrite-root ancestor");
        true
    }

    /// A real answer keeps a fresh online status.
    fn note_success(&self) {
        let st = self.monitor.status();
        if st.state == EndpointState::Online {
            self.monitor.set_status(
                EndpointStatus {
                    lastcheck: unix_now(),
                    ..st
                },
                true,
            );
        }
    }

    /// Request-path failures feed the monitor only when they look like
    /// connectivity problems; a definite negative answer is just
    /// absence.
    fn note_failure(&self, err: &ClientError, lfn: &str) {
        match err {
            ClientError::Transport(msg) => {
                warn!(backend = %self.desc.name, lfn = %lfn, error = %msg, "transport failure");
                let status = EndpointStatus {
                    state: EndpointState::Offline,
                    latency_ms: 0,
                    explanation: msg.clone(),
                    lastcheck: unix_now(),
                };
                self.monitor.set_status(status.clone(), true);
                if let Some(ext) = self.ext.as_deref() {
                    ext.put_backend_status(&self.desc.name, &status, self.desc.check_interval * 2);
                }
            }
            ClientError::NotFound | ClientError::PermissionDenied => {
                debug!(backend = %self.desc.name, lfn = %lfn, ?err, "negative answer");
            }
        }
    }

    /// Run the availability probe and record its outcome; a probe
    /// slower than the allowed maximum degrades the state.
    fn run_health_check(&self) {
        let mut status = self.client.probe();
        if status.lastcheck == 0 {
            status.lastcheck = unix_now();
        }
        if status.state == EndpointState::Online
            && u128::from(status.latency_ms) > self.desc.max_latency.as_millis()
        {
            status.state = EndpointState::Overloaded;
            status.explanation = format!(
                "probe latency {}ms exceeds allowed {}ms",
                status.latency_ms,
                self.desc.max_latency.as_millis()
            );
        }
        debug!(backend = %self.desc.name, state = ?status.state, latency = status.latency_ms, "probe");
        self.monitor.set_status(status, true);
    }

    /// Direct, synchronous write-path entry points used by the
    /// federation's scatter-gather operations. These run on the
    /// caller-provided gather thread pool semantics: the dispatcher
    /// enqueues a closure-free item and the protocol call happens on a
    /// worker via the gather handler.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }
}
