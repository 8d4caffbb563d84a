//! Per-backend availability state
//!
//! Each backend carries an [`AvailabilityMonitor`] fed by periodic
//! probes (and by request-path failures that look like connectivity
//! problems). The monitor feeds routing decisions through `is_ok()`
//! and is persisted to the external cache so that federation
//! instances can share probe results.

use crate::extcache::{self, ExtCache};
use metafed_common::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Health of one storage endpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointState {
    #[default]
    Unknown,
    Online,
    Offline,
    TemporaryOffline,
    NotExist,
    Overloaded,
    AuthError,
    OtherError,
}

/// One observation of an endpoint's health
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub state: EndpointState,
    /// Probe round-trip latency
    pub latency_ms: u64,
    /// Why the endpoint is in this state
    pub explanation: String,
    /// Unix time of the observation; updates must be strictly newer
    pub lastcheck: u64,
}

impl EndpointStatus {
    pub fn encode(&self) -> Result<Vec<u8>> {
        extcache::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        extcache::decode(bytes)
    }
}

struct MonitorState {
    status: EndpointStatus,
    /// Local change not yet pushed to the external cache
    dirty: bool,
    /// When the current state was entered, for the stabilization window
    state_since: u64,
}

/// Health state of one backend, shared between its workers, the
/// federator's routing checks, and the maintenance tick.
pub struct AvailabilityMonitor {
    backend: String,
    check_interval: Duration,
    /// An endpoint must hold `Online` this long before it is trusted
    stabilization: Duration,
    state: Mutex<MonitorState>,
}

impl AvailabilityMonitor {
    #[must_use]
    pub fn new(backend: impl Into<String>, check_interval: Duration, stabilization: Duration) -> Self {
        Self {
            backend: backend.into(),
            check_interval,
            stabilization,
            state: Mutex::new(MonitorState {
                status: EndpointStatus::default(),
                dirty: false,
                state_since: 0,
            }),
        }
    }

    /// Copy out the current status
    #[must_use]
    pub fn status(&self) -> EndpointStatus {
        self.state.lock().status.clone()
    }

    /// True when the last observation is older than the check interval
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        let st = self.state.lock();
        now.saturating_sub(st.status.lastcheck) > self.check_interval.as_secs()
    }

    /// Adopt a new observation. Rejected unless `lastcheck` is strictly
    /// newer than the stored one, which makes concurrent and replayed
    /// updates commutative.
    pub fn set_status(&self, new: EndpointStatus, mark_dirty: bool) {
        let mut st = self.state.lock();
        if new.lastcheck <= st.status.lastcheck {
            debug!(
                backend = %self.backend,
                stored = st.status.lastcheck,
                offered = new.lastcheck,
                "rejecting stale status update"
            );
            return;
        }
        if new.state != st.status.state {
            warn!(
                backend = %self.backend,
                from = ?st.status.state,
                to = ?new.state,
                explanation = %new.explanation,
                "endpoint state change"
            );
            st.state_since = new.lastcheck;
        }
        st.status = new;
        if mark_dirty {
            st.dirty = true;
        }
    }

    /// True only when the endpoint is online and has been online long
    /// enough to debounce flapping.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        let st = self.state.lock();
        if st.status.state != EndpointState::Online {
            return false;
        }
        let now = crate::record::unix_now();
        now.saturating_sub(st.state_since) >= self.stabilization.as_secs()
    }

    /// Periodic maintenance: prefer fresher shared status, push local
    /// dirty status out, and report whether a probe is due.
    pub fn tick(&self, now: u64, ext: Option<&dyn ExtCache>) -> TickAction {
        if let Some(ext) = ext {
            if let Some(shared) = ext.get_backend_status(&self.backend) {
                if shared.lastcheck > self.status().lastcheck {
                    self.set_status(shared, false);
                }
            }
        }

        let mut st = self.state.lock();
        if st.dirty && now.saturating_sub(st.status.lastcheck) <= self.check_interval.as_secs() {
            if let Some(ext) = ext {
                ext.put_backend_status(&self.backend, &st.status, self.check_interval * 2);
            }
            st.dirty = false;
            return TickAction::Pushed;
        }
        let expired = now.saturating_sub(st.status.lastcheck) > self.check_interval.as_secs();
        drop(st);

        if expired {
            TickAction::ProbeDue
        } else {
            TickAction::Idle
        }
    }
}

/// What the maintenance tick decided for a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickAction {
    /// Nothing to do
    Idle,
    /// The local status was pushed to the external cache
    Pushed,
    /// The status expired; a `HealthCheck` work item should be queued
    ProbeDue,
}
