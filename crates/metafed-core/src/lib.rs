//! MetaFed Federation Core
//!
//! This crate implements the dynamic federation engine for MetaFed
//! including:
//! - Per-path metadata records with concurrent completion tracking
//! - Bounded LRU + TTL record cache with external second-level cache
//! - Per-backend work queues and worker pools
//! - Backend availability monitoring with flap damping
//! - Name translation (prefix rewrite + hashed buckets)
//! - Replica selection (geo sort with fuzz shuffling)
//! - Request orchestration and scatter-gather write operations

pub mod backend;
pub mod cache;
pub mod dispatch;
pub mod extcache;
pub mod federator;
pub mod health;
pub mod record;
pub mod replica;
pub mod xlate;

// Re-exports
pub use backend::{
    BackendDescriptor, ClientError, ClientFactory, ClientRegistry, ClientResult, NullClient,
    ProtocolClient, StaticClient,
};
pub use cache::RecordCache;
pub use dispatch::{BackendDispatcher, WorkItem, WorkOp};
pub use extcache::{ExtCache, MemoryExtCache};
pub use federator::{BackendStatus, FederationStatus, Federator, GatherHandler};
pub use health::{AvailabilityMonitor, EndpointState, EndpointStatus, TickAction};
pub use record::{
    Aspect, FileRecord, InfoStatus, Replica, ReplicaStatus, StatInfo, SubItem, MODE_DIR,
};
pub use replica::{ClientInfo, GeoSorter, ReplicaFilter, ReplicaPipeline};
pub use xlate::NameXlation;
