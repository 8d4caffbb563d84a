//! Second-level (external, shared) cache interface
//!
//! Multiple federation instances can share a big external cache. The
//! core only needs the narrow get/put contract below; the memcached
//! wire client is an external collaborator implementing the same
//! trait. Payloads are opaque byte strings that must round-trip
//! losslessly; the record and status codecs live with their types.

use crate::health::EndpointStatus;
use dashmap::DashMap;
use metafed_common::{Error, Result};
use std::time::{Duration, Instant};

/// Narrow contract to an external shared cache. All operations are
/// best-effort: a miss or an unreachable cache is never an error for
/// the federation path.
pub trait ExtCache: Send + Sync {
    fn get_record(&self, key: &str) -> Option<Vec<u8>>;
    fn put_record(&self, key: &str, bytes: Vec<u8>, ttl: Duration);

    fn get_children(&self, key: &str) -> Option<Vec<u8>>;
    fn put_children(&self, key: &str, bytes: Vec<u8>, ttl: Duration);

    fn get_backend_status(&self, name: &str) -> Option<EndpointStatus>;
    fn put_backend_status(&self, name: &str, status: &EndpointStatus, ttl: Duration);
}

#[derive(Clone)]
struct Entry {
    bytes: Vec<u8>,
    expires: Instant,
}

/// In-process implementation of the external cache contract, used by
/// tests and single-instance deployments.
#[derive(Default)]
pub struct MemoryExtCache {
    entries: DashMap<String, Entry>,
}

impl MemoryExtCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let hit = self.entries.get(key)?;
        if hit.expires <= Instant::now() {
            drop(hit);
            self.entries.remove(key);
            return None;
        }
        Some(hit.bytes.clone())
    }

    fn put(&self, key: String, bytes: Vec<u8>, ttl: Duration) {
        self.entries.insert(
            key,
            Entry {
                bytes,
                expires: Instant::now() + ttl,
            },
        );
    }
}

impl ExtCache for MemoryExtCache {
    fn get_record(&self, key: &str) -> Option<Vec<u8>> {
        self.get(&format!("rec:{key}"))
    }

    fn put_record(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        self.put(format!("rec:{key}"), bytes, ttl);
    }

    fn get_children(&self, key: &str) -> Option<Vec<u8>> {
        self.get(&format!("kids:{key}"))
    }

    fn put_children(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        self.put(format!("kids:{key}"), bytes, ttl);
    }

    fn get_backend_status(&self, name: &str) -> Option<EndpointStatus> {
        let bytes = self.get(&format!("ep:{name}"))?;
        EndpointStatus::decode(&bytes).ok()
    }

    fn put_backend_status(&self, name: &str, status: &EndpointStatus, ttl: Duration) {
        if let Ok(bytes) = status.encode() {
            self.put(format!("ep:{name}"), bytes, ttl);
        }
    }
}

/// Encode helpers shared by `EndpointStatus`
pub(crate) fn encode<T: serde::Serialize>(v: &T) -> Result<Vec<u8>> {
    bincode::serialize(v).map_err(|e| Error::Encoding(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Decoding(e.to_string()))
}
