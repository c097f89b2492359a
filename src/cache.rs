//! Size-accounted, TTL-stamped, LRU-ordered in-memory cache.
//!
//! [`CacheManager`] is the admission/eviction/expiry/statistics API the fetch
//! and search layers use. Entries are accounted by caller-declared size; when
//! an insertion would overflow `max_size`, least-recently-touched entries are
//! evicted until it fits. A background sweeper purges expired entries every
//! `cleanup_interval` independent of access.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache config: {0}")]
    InvalidConfig(&'static str),
}

/// Capacity and lifetime limits for the cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum total accounted size of live entries, in bytes.
    pub max_size: u64,
    /// How long an entry stays valid after insertion.
    pub max_age: Duration,
    /// How often the background sweeper purges expired entries.
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 50 * 1024 * 1024,
            max_age: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<(), CacheError> {
        if self.max_size == 0 {
            return Err(CacheError::InvalidConfig("max_size must be positive"));
        }
        if self.max_age.is_zero() {
            return Err(CacheError::InvalidConfig("max_age must be positive"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "cleanup_interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Partial config change; `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct CacheConfigUpdate {
    pub max_size: Option<u64>,
    pub max_age: Option<Duration>,
    pub cleanup_interval: Option<Duration>,
}

/// Point-in-time counters snapshot. Only [`CacheManager::get_with_stats`]
/// feeds `hits`/`misses`; plain `get`/`has` query state without touching them.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: usize,
    pub current_size: u64,
    pub max_size: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            1.0 - self.hit_rate()
        }
    }
}

struct CacheEntry<V> {
    value: V,
    size: u64,
    expires_at: Instant,
    /// Monotonic last-access stamp; doubles as the LRU order key, so ties
    /// between never-touched entries fall back to insertion order.
    stamp: u64,
}

struct CacheState<V> {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry<V>>,
    /// Touch stamp -> key. The smallest stamp is the LRU victim.
    order: BTreeMap<u64, String>,
    next_stamp: u64,
    current_size: u64,
    hits: u64,
    misses: u64,
}

impl<V: Clone> CacheState<V> {
    fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_stamp: 0,
            current_size: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn bump_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.stamp);
                self.current_size -= entry.size;
                true
            }
            None => false,
        }
    }

    /// Admission + eviction. Rejects entries larger than the whole cache;
    /// otherwise evicts by ascending touch stamp until the entry fits.
    fn admit(&mut self, key: String, value: V, size: u64, now: Instant) -> bool {
        if size > self.config.max_size {
            return false;
        }
        // Replacing a key releases its old accounting first.
        self.remove(&key);
        while self.current_size + size > self.config.max_size {
            let Some((_, victim)) = self.order.pop_first() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&victim) {
                self.current_size -= evicted.size;
                tracing::debug!(key = %victim, size = evicted.size, "evicted LRU cache entry");
            }
        }
        // Eviction can always free up to max_size, so an admissible entry fits.
        debug_assert!(self.current_size + size <= self.config.max_size);
        let stamp = self.bump_stamp();
        self.order.insert(stamp, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                size,
                expires_at: now + self.config.max_age,
                stamp,
            },
        );
        self.current_size += size;
        true
    }

    /// Expiry-checking lookup with an LRU touch. Expired entries are removed
    /// as a side effect and reported as missing.
    fn lookup(&mut self, key: &str, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => now >= entry.expires_at,
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }
        let stamp = self.bump_stamp();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.stamp);
        self.order.insert(stamp, key.to_string());
        entry.stamp = stamp;
        Some(entry.value.clone())
    }

    fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.current_size = 0;
        self.hits = 0;
        self.misses = 0;
    }
}

/// In-memory cache with admission control, LRU eviction, and TTL expiry.
///
/// Values are cloned out on access; the fetch layer stores serialized
/// document content keyed by document name, with content length as `size`.
pub struct CacheManager<V> {
    state: Arc<RwLock<CacheState<V>>>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<V: Clone + Send + Sync + 'static> CacheManager<V> {
    /// Creates the cache and starts its background expiry sweeper.
    /// Fails fast on non-positive config values.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let interval = config.cleanup_interval;
        let state = Arc::new(RwLock::new(CacheState::new(config)));
        let sweeper = spawn_sweeper(Arc::clone(&state), interval);
        Ok(Self {
            state,
            sweeper: std::sync::Mutex::new(Some(sweeper)),
        })
    }

    /// Inserts `value` under `key`, evicting least-recently-touched entries
    /// until it fits. Returns `false` (and mutates nothing) when `size`
    /// exceeds `max_size`.
    pub async fn set(&self, key: impl Into<String>, value: V, size: u64) -> bool {
        self.state
            .write()
            .await
            .admit(key.into(), value, size, Instant::now())
    }

    /// Returns the live value for `key`, refreshing its LRU position.
    /// An expired entry is deleted as a side effect and treated as missing.
    /// Does not count toward hit/miss statistics.
    pub async fn get(&self, key: &str) -> Option<V> {
        self.state.write().await.lookup(key, Instant::now())
    }

    /// Same expiry and touch semantics as [`get`](Self::get), without
    /// returning the value or counting statistics.
    pub async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// Like [`get`](Self::get), but feeds the hit/miss counters. This is the
    /// only entry point that affects statistics.
    pub async fn get_with_stats(&self, key: &str) -> Option<V> {
        let mut state = self.state.write().await;
        let found = state.lookup(key, Instant::now());
        match found {
            Some(_) => state.hits += 1,
            None => state.misses += 1,
        }
        found
    }

    /// Looks up every key, returning only those present and unexpired.
    pub async fn get_many(&self, keys: &[&str]) -> HashMap<String, V> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let mut found = HashMap::new();
        for key in keys {
            if let Some(value) = state.lookup(key, now) {
                found.insert((*key).to_string(), value);
            }
        }
        found
    }

    /// Inserts each entry independently; an oversized entry is reported as
    /// `false` for its key without blocking or rolling back the others.
    pub async fn set_many(&self, entries: Vec<(String, V, u64)>) -> HashMap<String, bool> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        entries
            .into_iter()
            .map(|(key, value, size)| {
                let accepted = state.admit(key.clone(), value, size, now);
                (key, accepted)
            })
            .collect()
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.state.write().await.remove(key)
    }

    /// Drops all entries and zeroes the counters atomically.
    pub async fn clear(&self) {
        self.state.write().await.clear();
    }

    /// Synchronous sweep of every entry past its expiry, independent of LRU.
    /// The background timer runs this same sweep every `cleanup_interval`.
    pub async fn cleanup(&self) -> usize {
        self.state.write().await.sweep_expired(Instant::now())
    }

    pub async fn get_stats(&self) -> CacheStats {
        let state = self.state.read().await;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            entry_count: state.entries.len(),
            current_size: state.current_size,
            max_size: state.config.max_size,
        }
    }

    /// Zeroes the hit/miss counters, leaving entries untouched.
    pub async fn reset_stats(&self) {
        let mut state = self.state.write().await;
        state.hits = 0;
        state.misses = 0;
    }

    /// Merges a partial config change. A larger `max_size` immediately
    /// permits larger future insertions; existing entries are never
    /// retroactively evicted, only displaced by a later `set`. A changed
    /// `cleanup_interval` re-arms the running sweeper.
    pub async fn update_config(&self, update: CacheConfigUpdate) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        let mut merged = state.config.clone();
        if let Some(max_size) = update.max_size {
            merged.max_size = max_size;
        }
        if let Some(max_age) = update.max_age {
            merged.max_age = max_age;
        }
        if let Some(cleanup_interval) = update.cleanup_interval {
            merged.cleanup_interval = cleanup_interval;
        }
        merged.validate()?;
        let interval_changed = merged.cleanup_interval != state.config.cleanup_interval;
        state.config = merged;
        let interval = state.config.cleanup_interval;
        drop(state);
        if interval_changed {
            let mut sweeper = self.sweeper.lock().unwrap();
            if let Some(handle) = sweeper.take() {
                handle.abort();
                *sweeper = Some(spawn_sweeper(Arc::clone(&self.state), interval));
            }
        }
        Ok(())
    }

    /// Live keys as of the call; expired entries are filtered out lazily,
    /// not purged.
    pub async fn keys(&self) -> Vec<String> {
        let state = self.state.read().await;
        let now = Instant::now();
        state
            .entries
            .iter()
            .filter(|(_, entry)| now < entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Live values as of the call, same lazy expiry filter as [`keys`](Self::keys).
    pub async fn values(&self) -> Vec<V> {
        let state = self.state.read().await;
        let now = Instant::now();
        state
            .entries
            .values()
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// Cancels the background sweeper and releases all entries. Safe to call
    /// repeatedly.
    pub async fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.state.write().await.clear();
    }
}

impl<V> Drop for CacheManager<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn spawn_sweeper<V: Clone + Send + Sync + 'static>(
    state: Arc<RwLock<CacheState<V>>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = state.write().await.sweep_expired(Instant::now());
            if removed > 0 {
                tracing::debug!(removed, "swept expired cache entries");
            }
        }
    })
}
