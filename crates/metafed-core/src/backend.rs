//! Backend plugin contract
//!
//! A backend is one configured storage endpoint. The generic async
//! machinery (queue, workers, availability, translation) lives in the
//! dispatcher; everything protocol-specific is behind the narrow
//! [`ProtocolClient`] interface. Concrete clients are selected by the
//! configuration `kind` through a registry built at startup; there is
//! no dynamic library loading.

use crate::health::{EndpointState, EndpointStatus};
use crate::record::{unix_now, Replica, ReplicaStatus, StatInfo, SubItem, MODE_DIR};
use crate::xlate::NameXlation;
use metafed_common::config::BackendConfig;
use metafed_common::{path, Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Failure modes a protocol client can report. The dispatcher absorbs
/// all of them; the federation layer only ever observes absence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientError {
    /// The endpoint answered: the path does not exist
    NotFound,
    /// The endpoint answered: not allowed
    PermissionDenied,
    /// No usable answer (timeout, connection refused, protocol error)
    Transport(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Narrow interface to one protocol-specific endpoint client. All
/// calls are synchronous; they run on the owning dispatcher's worker
/// threads, never under any record or cache lock.
pub trait ProtocolClient: Send + Sync {
    /// Stat one translated path
    fn stat(&self, path: &str) -> ClientResult<StatInfo>;

    /// Replica URLs realizing one translated path
    fn locate(&self, path: &str) -> ClientResult<Vec<String>>;

    /// Immediate children of one translated path
    fn list(&self, path: &str) -> ClientResult<Vec<SubItem>>;

    /// Does this endpoint know this exact replica URL?
    fn check_replica(&self, url: &str) -> ClientResult<bool>;

    /// Availability probe; returns the observed status
    fn probe(&self) -> EndpointStatus;

    /// Propose a location where a new file of `size` bytes could be
    /// written under the translated path
    fn new_location(&self, path: &str, size: u64) -> ClientResult<Replica>;

    /// Delete every local replica of the translated path; returns the
    /// replicas acted upon with their outcome
    fn delete(&self, path: &str) -> ClientResult<Vec<Replica>>;
}

/// Static description of one configured backend
#[derive(Clone, Debug)]
pub struct BackendDescriptor {
    /// Position in the federation's backend table, stamped on replicas
    pub id: usize,
    pub name: String,
    pub readable: bool,
    pub writable: bool,
    pub listable: bool,
    /// Invoked only by other backends' cross-validation
    pub slave: bool,
    /// Located replicas are cross-validated by slaves instead of
    /// inserted directly
    pub replica_xlator: bool,
    pub workers: usize,
    pub base_url: String,
    pub check_interval: Duration,
    pub max_latency: Duration,
    pub stabilization: Duration,
    pub xlation: NameXlation,
}

impl BackendDescriptor {
    #[must_use]
    pub fn from_config(id: usize, cfg: &BackendConfig) -> Self {
        Self {
            id,
            name: cfg.name.clone(),
            readable: cfg.readable,
            writable: cfg.writable,
            listable: cfg.listable,
            slave: cfg.slave,
            replica_xlator: cfg.replica_xlator,
            workers: cfg.workers,
            base_url: cfg.base_url.clone(),
            check_interval: Duration::from_secs(cfg.check_interval_secs),
            max_latency: Duration::from_millis(cfg.max_latency_ms),
            stabilization: Duration::from_secs(cfg.stabilization_secs),
            xlation: NameXlation::new(cfg.xlat.clone(), cfg.xlat_hashed.clone()),
        }
    }
}

/// Factory building a protocol client from its backend configuration
pub type ClientFactory = fn(&BackendConfig) -> Result<Arc<dyn ProtocolClient>>;

/// Startup-built lookup table mapping a configuration `kind` to a
/// client factory. Replaces dlopen-style plugin loading.
pub struct ClientRegistry {
    factories: HashMap<String, ClientFactory>,
}

impl ClientRegistry {
    /// Registry with the built-in kinds (`static`, `null`)
    #[must_use]
    pub fn builtin() -> Self {
        let mut reg = Self {
            factories: HashMap::new(),
        };
        reg.register("static", |_cfg| Ok(Arc::new(StaticClient::new())));
        reg.register("null", |_cfg| Ok(Arc::new(NullClient)));
        reg
    }

    pub fn register(&mut self, kind: &str, factory: ClientFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn build(&self, cfg: &BackendConfig) -> Result<Arc<dyn ProtocolClient>> {
        let factory = self
            .factories
            .get(&cfg.kind)
            .ok_or_else(|| Error::UnknownBackendKind(cfg.kind.clone()))?;
        factory(cfg)
    }
}

#[derive(Clone, Debug)]
struct StaticNode {
    dir: bool,
    size: u64,
    replicas: Vec<String>,
}

/// In-memory protocol client serving a hand-built namespace. Used by
/// tests and demo configurations.
pub struct StaticClient {
    tree: RwLock<BTreeMap<String, StaticNode>>,
    /// Simulated per-call delay
    delay: RwLock<Duration>,
    latency_ms: RwLock<u64>,
}

impl Default for StaticClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticClient {
    #[must_use]
    pub fn new() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert(
            "/".to_string(),
            StaticNode {
                dir: true,
                size: 0,
                replicas: vec![],
            },
        );
        Self {
            tree: RwLock::new(tree),
            delay: RwLock::new(Duration::ZERO),
            latency_ms: RwLock::new(1),
        }
    }

    pub fn add_dir(&self, lfn: &str) {
        self.tree.write().insert(
            path::trim_path(lfn),
            StaticNode {
                dir: true,
                size: 0,
                replicas: vec![],
            },
        );
    }

    pub fn add_file(&self, lfn: &str, size: u64, replicas: &[&str]) {
        self.tree.write().insert(
            path::trim_path(lfn),
            StaticNode {
                dir: false,
                size,
                replicas: replicas.iter().map(|s| (*s).to_string()).collect(),
            },
        );
    }

    /// Make every call sleep, to exercise timeout paths
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = delay;
    }

    pub fn set_latency_ms(&self, ms: u64) {
        *self.latency_ms.write() = ms;
    }

    fn pause(&self) {
        let d = *self.delay.read();
        if d > Duration::ZERO {
            std::thread::sleep(d);
        }
    }
}

impl ProtocolClient for StaticClient {
    fn stat(&self, path: &str) -> ClientResult<StatInfo> {
        self.pause();
        let tree = self.tree.read();
        let node = tree.get(path).ok_or(ClientError::NotFound)?;
        let nlink = if node.dir {
            tree.keys()
                .filter(|k| is_direct_child(path, k))
                .count() as u64
        } else {
            1
        };
        Ok(StatInfo {
            size: node.size,
            mode: if node.dir { 0o755 | MODE_DIR } else { 0o644 },
            nlink,
            mtime: unix_now(),
            ..StatInfo::default()
        })
    }

    fn locate(&self, path: &str) -> ClientResult<Vec<String>> {
        self.pause();
        let tree = self.tree.read();
        let node = tree.get(path).ok_or(ClientError::NotFound)?;
        Ok(node.replicas.clone())
    }

    fn list(&self, path: &str) -> ClientResult<Vec<SubItem>> {
        self.pause();
        let tree = self.tree.read();
        let node = tree.get(path).ok_or(ClientError::NotFound)?;
        if !node.dir {
            return Err(ClientError::NotFound);
        }
        Ok(tree
            .keys()
            .filter(|k| is_direct_child(path, k))
            .filter_map(|k| path::split_parent(k))
            .map(|(_, child)| SubItem {
                name: child.to_string(),
                location: String::new(),
            })
            .collect())
    }

    fn check_replica(&self, url: &str) -> ClientResult<bool> {
        self.pause();
        let tree = self.tree.read();
        Ok(tree.values().any(|n| n.replicas.iter().any(|r| r == url)))
    }

    fn probe(&self) -> EndpointStatus {
        EndpointStatus {
            state: EndpointState::Online,
            latency_ms: *self.latency_ms.read(),
            explanation: String::new(),
            lastcheck: unix_now(),
        }
    }

    fn new_location(&self, path: &str, _size: u64) -> ClientResult<Replica> {
        self.pause();
        Ok(Replica {
            name: format!("static://{path}"),
            status: ReplicaStatus::Available,
            ..Replica::default()
        })
    }

    fn delete(&self, path: &str) -> ClientResult<Vec<Replica>> {
        self.pause();
        let mut tree = self.tree.write();
        match tree.remove(path) {
            Some(node) => Ok(node
                .replicas
                .into_iter()
                .map(|name| Replica {
                    name,
                    status: ReplicaStatus::Available,
                    ..Replica::default()
                })
                .collect()),
            None => Err(ClientError::NotFound),
        }
    }
}

/// True when `candidate` is a direct child path of `parent`
fn is_direct_child(parent: &str, candidate: &str) -> bool {
    path::is_ancestor_of(parent, candidate)
        && path::split_parent(candidate).is_some_and(|(p, _)| p == parent)
}

/// Client that denies existence of everything. Useful as a stand-in
/// for a misconfigured endpoint.
pub struct NullClient;

impl ProtocolClient for NullClient {
    fn stat(&self, _path: &str) -> ClientResult<StatInfo> {
        Err(ClientError::NotFound)
    }

    fn locate(&self, _path: &str) -> ClientResult<Vec<String>> {
        Err(ClientError::NotFound)
    }

    fn list(&self, _path: &str) -> ClientResult<Vec<SubItem>> {
        Err(ClientError::NotFound)
    }

    fn check_replica(&self, _url: &str) -> ClientResult<bool> {
        Ok(false)
    }

    fn probe(&self) -> EndpointStatus {
        EndpointStatus {
            state: EndpointState::Online,
            latency_ms: 0,
            explanation: String::new(),
            lastcheck: unix_now(),
        }
    }

    fn new_location(&self, _path: &str, _size: u64) -> ClientResult<Replica> {
        Err(ClientError::NotFound)
    }

    fn delete(&self, _path: &str) -> ClientResult<Vec<Replica>> {
        Err(ClientError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_client_namespace() {
        let c = StaticClient::new();
        c.add_dir("/data");
        c.add_file("/data/f1", 10, &["http://se1/data/f1"]);
        c.add_file("/data/f2", 20, &[]);
        c.add_dir("/data/sub");
        c.add_file("/data/sub/deep", 1, &[]);

        let st = c.stat("/data/f1").unwrap();
        assert_eq!(st.size, 10);
        assert_eq!(st.mode & MODE_DIR, 0);

        let st = c.stat("/data").unwrap();
        assert!(st.mode & MODE_DIR != 0);
        assert_eq!(st.nlink, 3);

        let mut names: Vec<_> = c.list("/data").unwrap().into_iter().map(|i| i.name).collect();
        names.sort();
        assert_eq!(names, ["f1", "f2", "sub"]);

        assert_eq!(c.stat("/nope").unwrap_err(), ClientError::NotFound);
        assert_eq!(c.locate("/data/f1").unwrap(), ["http://se1/data/f1"]);
        assert!(c.check_replica("http://se1/data/f1").unwrap());
        assert!(!c.check_replica("http://se9/other").unwrap());
    }

    #[test]
    fn test_static_client_delete() {
        let c = StaticClient::new();
        c.add_file("/data/f1", 10, &["http://se1/data/f1"]);
        let gone = c.delete("/data/f1").unwrap();
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].status, ReplicaStatus::Available);
        assert_eq!(c.stat("/data/f1").unwrap_err(), ClientError::NotFound);
    }

    #[test]
    fn test_registry_builds_by_kind() {
        let reg = ClientRegistry::builtin();
        let mut cfg = BackendConfig {
            name: "b1".to_string(),
            kind: "static".to_string(),
            workers: 1,
            readable: true,
            writable: false,
            listable: true,
            slave: false,
            replica_xlator: false,
            base_url: String::new(),
            check_interval_secs: 60,
            max_latency_ms: 5000,
            stabilization_secs: 0,
            xlat: vec![],
            xlat_hashed: vec![],
        };
        assert!(reg.build(&cfg).is_ok());

        cfg.kind = "webdav".to_string();
        assert!(matches!(
            reg.build(&cfg),
            Err(Error::UnknownBackendKind(_))
        ));
    }
}
