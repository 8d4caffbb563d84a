//! Configuration types for MetaFed
//!
//! This module defines the configuration structures consumed by the
//! federation core, loaded from a TOML file with `METAFED_`-prefixed
//! environment variable overrides.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration for MetaFed
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Global federation behavior
    #[serde(default)]
    pub global: GlobalConfig,
    /// First-level record cache
    #[serde(default)]
    pub cache: CacheConfig,
    /// Configured storage backends
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Global federation behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Seconds a request waits for backend answers before finalizing
    pub wait_timeout_secs: u64,
    /// Seconds between maintenance ticks (cache expiry, health refresh)
    pub tick_secs: u64,
    /// Listings larger than this are marked as errors, never truncated
    pub max_listing_items: usize,
    /// Fan out a stat for every child after a listing
    pub stat_subdirs: bool,
    /// Insert a freshly stat-ed entry into its parent's cached listing
    pub add_child_on_stat: bool,
    /// Global name-to-name prefix rewrite applied before any backend sees a path
    pub n2n_pfx: String,
    /// Replacement for `n2n_pfx`
    pub n2n_newpfx: String,
    /// Geo-sort fuzz radius in kilometers (0 disables the shuffle)
    pub geo_fuzz_km: f64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 30,
            tick_secs: 10,
            max_listing_items: 2000,
            stat_subdirs: false,
            add_child_on_stat: true,
            n2n_pfx: String::new(),
            n2n_newpfx: String::new(),
            geo_fuzz_km: 10.0,
        }
    }
}

/// First-level record cache sizing and aging
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of records held in memory
    pub max_items: usize,
    /// Standard TTL for a cached record, in seconds
    pub item_ttl_secs: u64,
    /// Hard upper bound on a record's lifetime, in seconds
    pub item_maxttl_secs: u64,
    /// Shorter TTL for "not found" records, in seconds
    pub item_ttl_negative_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 1_000_000,
            item_ttl_secs: 86_400,
            item_maxttl_secs: 172_800,
            item_ttl_negative_secs: 10,
        }
    }
}

/// One prefix rewrite rule applied during name translation
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct XlatRule {
    /// Prefix to match on the logical path
    pub from: String,
    /// Replacement prefix
    pub to: String,
}

/// One configured storage backend
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name
    pub name: String,
    /// Registry key selecting the protocol client implementation
    pub kind: String,
    /// Worker threads serving this backend's queue
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capability flags
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default)]
    pub writable: bool,
    #[serde(default = "default_true")]
    pub listable: bool,
    /// Invoked only by other backends' cross-validation, never directly
    #[serde(default)]
    pub slave: bool,
    /// Delegates replica validation to the slave backends
    #[serde(default)]
    pub replica_xlator: bool,
    /// Endpoint base URL, prepended to every translated path
    #[serde(default)]
    pub base_url: String,
    /// Seconds between availability probes
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Probes slower than this mark the endpoint overloaded
    #[serde(default = "default_max_latency")]
    pub max_latency_ms: u64,
    /// Seconds the endpoint must stay online before it is trusted
    #[serde(default)]
    pub stabilization_secs: u64,
    /// Plain prefix rewrite rules, first registered wins
    #[serde(default)]
    pub xlat: Vec<XlatRule>,
    /// Hash-bucketed rewrite rules for content-addressed stores
    #[serde(default)]
    pub xlat_hashed: Vec<XlatRule>,
}

fn default_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> u64 {
    60
}

fn default_max_latency() -> u64 {
    5000
}

impl Config {
    /// Load configuration from a TOML file, with `METAFED_` environment
    /// variable overrides (double underscore as the section separator).
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("METAFED").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations whose TTL ordering would make the cache
    /// misbehave, and duplicate backend names.
    pub fn validate(&self) -> Result<()> {
        if self.cache.item_ttl_secs > self.cache.item_maxttl_secs {
            return Err(Error::InvalidConfig(format!(
                "cache.item_ttl_secs ({}) must not exceed cache.item_maxttl_secs ({})",
                self.cache.item_ttl_secs, self.cache.item_maxttl_secs
            )));
        }
        if self.cache.item_ttl_negative_secs >= self.cache.item_ttl_secs {
            return Err(Error::InvalidConfig(format!(
                "cache.item_ttl_negative_secs ({}) must be below cache.item_ttl_secs ({})",
                self.cache.item_ttl_negative_secs, self.cache.item_ttl_secs
            )));
        }
        for (i, b) in self.backends.iter().enumerate() {
            if b.name.is_empty() {
                return Err(Error::InvalidConfig(format!("backend #{i} has no name")));
            }
            if b.workers == 0 {
                return Err(Error::InvalidConfig(format!(
                    "backend {} must have at least one worker",
                    b.name
                )));
            }
            if self.backends[..i].iter().any(|o| o.name == b.name) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate backend name: {}",
                    b.name
                )));
            }
        }
        Ok(())
    }
}
