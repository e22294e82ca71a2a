//! Staleness-bounded memoization keyed by `(primary, secondary)` ids.
//!
//! # Semantics
//!
//! - A miss calls the fetch function once and stores whatever it returns,
//!   [`Lookup::Found`] and [`Lookup::NotFound`] alike, under the same refresh
//!   interval. Fetch errors are never stored.
//! - A stale hit (age past the refresh interval, or force-invalidated)
//!   refetches. If that refetch fails the error is returned and the stale
//!   entry is dropped; stale values are never served.
//! - One lock covers the whole map and is held across the fetch, so at most
//!   one fetch is in flight per cache. A fetch function must not call back
//!   into the same cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use credagent_core::CacheConfig;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Composite key ordered by primary id, then secondary id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub primary: String,
    pub secondary: String,
}

impl CacheKey {
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
        }
    }
}

/// Outcome of a lookup. `NotFound` is a cached answer, not a miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Found(V),
    NotFound,
}

impl<V> Lookup<V> {
    pub fn found(self) -> Option<V> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The authority refused access to the value
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// The fetch failed for any other reason
    #[error("upstream fetch failed: {0}")]
    Upstream(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Time source for staleness checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock()
    }
}

struct CacheEntry<V> {
    value: Lookup<V>,
    last_refreshed_at: Instant,
    force_stale: bool,
}

pub struct StalenessCache<V> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<BTreeMap<CacheKey, CacheEntry<V>>>,
}

impl<V: Clone> StalenessCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the cached value for `key`, fetching on a miss or stale hit.
    pub fn lookup<F>(&self, key: &CacheKey, fetch: F) -> CacheResult<Lookup<V>>
    where
        F: FnOnce(&CacheKey) -> CacheResult<Lookup<V>>,
    {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(key) {
            if !self.is_stale(entry) {
                trace!(primary = %key.primary, secondary = %key.secondary, "Cache hit");
                return Ok(entry.value.clone());
            }
            debug!(primary = %key.primary, secondary = %key.secondary, "Cache entry stale, refreshing");
        }

        match fetch(key) {
            Ok(value) => {
                entries.insert(
                    key.clone(),
                    CacheEntry {
                        value: value.clone(),
                        last_refreshed_at: self.clock.now(),
                        force_stale: false,
                    },
                );
                Ok(value)
            }
            Err(err) => {
                if entries.remove(key).is_some() {
                    warn!(
                        primary = %key.primary,
                        secondary = %key.secondary,
                        error = %err,
                        "Refresh failed, stale entry discarded"
                    );
                }
                Err(err)
            }
        }
    }

    /// Store a value obtained outside `lookup`, unless a fresh entry exists.
    pub fn seed(&self, key: CacheKey, value: V) {
        let mut entries = self.entries.lock();
        if entries.get(&key).is_some_and(|e| !self.is_stale(e)) {
            return;
        }
        entries.insert(
            key,
            CacheEntry {
                value: Lookup::Found(value),
                last_refreshed_at: self.clock.now(),
                force_stale: false,
            },
        );
    }

    /// Force the next lookup of `key` to refetch. Returns whether an entry existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        match self.entries.lock().get_mut(key) {
            Some(entry) => {
                entry.force_stale = true;
                true
            }
            None => false,
        }
    }

    pub fn invalidate_all(&self) {
        for entry in self.entries.lock().values_mut() {
            entry.force_stale = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_stale(&self, entry: &CacheEntry<V>) -> bool {
        entry.force_stale
            || self
                .config
                .refresh_interval
                .is_expired(self.clock.now().saturating_duration_since(entry.last_refreshed_at))
    }
}
