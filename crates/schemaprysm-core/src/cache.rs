//! Snapshot Cache Store
//!
//! Bounded, TTL-based key/value store for fully materialized model snapshots.
//!
//! - Entries expire after a per-entry TTL; an expired entry reads as a miss
//!   even before the background sweep removes it
//! - Entry-count and memory budgets evict expired entries first, then the
//!   least recently used ones
//! - Hit/miss counters are atomics and reset only by [`CacheStore::clear`]
//!
//! Thread-safe: all methods take `&self`. Entries live in a sharded
//! `DashMap`; only budget enforcement is serialized, and readers never wait
//! on it.

use dashmap::DashMap;
use parking_lot::Mutex;
use schemaprysm_config::CacheConfig;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Shortest compaction period accepted by the background sweep
const MIN_COMPACTION_INTERVAL: Duration = Duration::from_millis(10);

/// Errors surfaced by cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache key must not be empty")]
    InvalidKey,

    #[error("cache backend failure for key '{key}': {message}")]
    Backend { key: String, message: String },
}

impl CacheError {
    /// Create a Backend error
    pub fn backend(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Why an entry left the cache without an explicit `remove`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// TTL elapsed
    Expired,
    /// `max_cache_size` exceeded
    EntryLimit,
    /// Memory budget exceeded
    MemoryLimit,
}

/// Callback invoked when an entry is evicted
pub type EvictionListener<V> = Arc<dyn Fn(&str, &Arc<V>, EvictionReason) + Send + Sync>;

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    /// Total `get` calls counted
    pub total_requests: u64,
    /// Requests that found a live entry
    pub hits: u64,
    /// Requests that found nothing or an expired entry
    pub misses: u64,
    /// hits / total_requests (0.0 when there were no requests)
    pub hit_rate: f64,
    /// Entries physically stored (including expired ones not yet swept)
    pub current_size: usize,
    /// Sum of entry size estimates
    pub estimated_memory_bytes: usize,
    /// Entries removed by TTL sweep or budget pressure
    pub evictions: u64,
    /// Hit rate fell below the configured threshold after enough samples
    pub low_hit_rate: bool,
}

/// Lock-free counters backing [`CacheStatistics`]
#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

/// A stored snapshot and its bookkeeping
struct CacheEntry<V> {
    value: Arc<V>,
    inserted_at: Instant,
    /// `None` when the TTL is too large to represent
    expires_at: Option<Instant>,
    size_estimate: usize,
    /// Logical clock tick of the last write or hit (LRU ordering)
    last_access: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }
}

/// `io::Write` sink that only counts bytes
struct ByteCounter(usize);

impl std::io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Estimate the footprint of a value as the length of its JSON encoding
pub fn estimate_size<V: Serialize + ?Sized>(value: &V) -> Result<usize, serde_json::Error> {
    let mut counter = ByteCounter(0);
    serde_json::to_writer(&mut counter, value)?;
    Ok(counter.0)
}

/// Composite cache key for a model snapshot
pub fn model_cache_key(project: &str, model: &str) -> String {
    format!("{}:{}", project, model)
}

/// Eviction victim chosen by the budget scan
struct Victim {
    key: String,
    expired: bool,
}

/// Bounded TTL cache for model snapshots
pub struct CacheStore<V> {
    config: CacheConfig,
    max_memory_bytes: usize,
    entries: DashMap<String, CacheEntry<V>>,
    counters: CacheCounters,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    /// Serializes budget enforcement between concurrent writers
    eviction_lock: Mutex<()>,
    listener: Option<EvictionListener<V>>,
}

impl<V> CacheStore<V>
where
    V: Serialize + Send + Sync + 'static,
{
    /// Create a cache from configuration
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            max_memory_bytes: config.memory_limit_bytes(),
            config: config.clone(),
            entries: DashMap::new(),
            counters: CacheCounters::default(),
            clock: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            listener: None,
        }
    }

    /// Create a cache with default configuration
    pub fn with_defaults() -> Self {
        Self::new(&CacheConfig::default())
    }

    /// Register the eviction callback
    pub fn with_eviction_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&str, &Arc<V>, EvictionReason) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Configuration this cache was built from
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of physically stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn stats_enabled(&self) -> bool {
        self.config.enabled && self.config.enable_statistics
    }

    /// Look up a snapshot
    ///
    /// Never blocks on I/O. Expired entries count as misses.
    pub fn get(&self, key: &str) -> Result<Option<Arc<V>>, CacheError> {
        validate_key(key)?;
        if !self.config.enabled {
            return Ok(None);
        }

        let now = Instant::now();
        let found = self.entries.get(key).and_then(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                entry.touch(self.next_tick());
                Some(Arc::clone(&entry.value))
            }
        });

        if self.stats_enabled() {
            if found.is_some() {
                self.counters.record_hit();
            } else {
                self.counters.record_miss();
            }
        }

        trace!(key, hit = found.is_some(), "cache lookup");
        Ok(found)
    }

    /// Store a snapshot with the default TTL
    pub fn set(&self, key: &str, value: V) -> Result<(), CacheError> {
        self.set_with_expiration(key, value, self.config.default_expiration())
    }

    /// Store a snapshot with an explicit TTL
    ///
    /// Overwrites any existing entry. A zero TTL stores an already-expired
    /// entry. If the value cannot be measured the previous entry is left
    /// untouched.
    pub fn set_with_expiration(
        &self,
        key: &str,
        value: V,
        expiration: Duration,
    ) -> Result<(), CacheError> {
        validate_key(key)?;
        if !self.config.enabled {
            trace!(key, "cache disabled, skipping set");
            return Ok(());
        }

        let size_estimate = estimate_size(&value).map_err(|e| {
            warn!(key, error = %e, "failed to size cache entry, keeping previous state");
            CacheError::backend(key, e.to_string())
        })?;

        let now = Instant::now();
        let entry = CacheEntry {
            value: Arc::new(value),
            inserted_at: now,
            expires_at: now.checked_add(expiration),
            size_estimate,
            last_access: AtomicU64::new(self.next_tick()),
        };
        self.entries.insert(key.to_string(), entry);
        debug!(key, size_estimate, ttl_secs = expiration.as_secs(), "cached snapshot");

        self.enforce_budget(key);
        Ok(())
    }

    /// Remove an entry
    ///
    /// Returns whether a live (unexpired) entry was present.
    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    /// Check for a live entry without touching statistics or LRU order
    pub fn exists(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        if !self.config.enabled {
            return Ok(false);
        }
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    /// Remove every entry and reset all counters
    pub fn clear(&self) {
        let _guard = self.eviction_lock.lock();
        self.entries.clear();
        self.counters.reset();
        debug!("cache cleared");
    }

    /// Point-in-time statistics
    ///
    /// Logs a warning when the hit rate is below the configured threshold
    /// once enough requests have been observed.
    pub fn statistics(&self) -> CacheStatistics {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            hits as f64 / total_requests as f64
        };
        let (current_size, estimated_memory_bytes) = self.usage();

        let low_hit_rate = self.stats_enabled()
            && total_requests >= self.config.min_requests_for_hit_rate
            && hit_rate < self.config.hit_rate_threshold;
        if low_hit_rate {
            warn!(
                hit_rate,
                threshold = self.config.hit_rate_threshold,
                total_requests,
                "snapshot cache hit rate below threshold"
            );
        }

        CacheStatistics {
            total_requests,
            hits,
            misses,
            hit_rate,
            current_size,
            estimated_memory_bytes,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            low_hit_rate,
        }
    }

    /// Remove entries whose TTL has elapsed
    ///
    /// Expiry is re-checked atomically per entry, so a key refreshed by a
    /// concurrent `set` is never removed. Returns the number removed.
    pub fn compact(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if let Some((key, entry)) = self.entries.remove_if(&key, |_, e| e.is_expired(now)) {
                removed += 1;
                self.counters.record_eviction();
                trace!(
                    key = %key,
                    age_ms = now.duration_since(entry.inserted_at).as_millis() as u64,
                    "swept expired entry"
                );
                self.notify(&key, &entry.value, EvictionReason::Expired);
            }
        }

        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "compacted snapshot cache");
        }
        removed
    }

    /// Start the periodic background sweep
    ///
    /// The task holds only a weak reference and stops once the cache is
    /// dropped or the handle is shut down or dropped.
    pub fn spawn_compaction(self: &Arc<Self>) -> CompactionHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.compaction_interval().max(MIN_COMPACTION_INTERVAL);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(store) = weak.upgrade() else {
                            break;
                        };
                        store.compact();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("cache compaction task stopped");
        });

        CompactionHandle {
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Entry count and total size estimate
    fn usage(&self) -> (usize, usize) {
        let mut count = 0;
        let mut bytes = 0;
        for entry in self.entries.iter() {
            count += 1;
            bytes += entry.size_estimate;
        }
        (count, bytes)
    }

    /// Evict until both budgets hold, sparing `protected` while possible
    ///
    /// Listeners run after the eviction lock is released, so they may call
    /// back into the cache.
    fn enforce_budget(&self, protected: &str) {
        let evicted = self.collect_evictions(protected);
        for (key, value, reason) in evicted {
            self.notify(&key, &value, reason);
        }
    }

    fn collect_evictions(&self, protected: &str) -> Vec<(String, Arc<V>, EvictionReason)> {
        let _guard = self.eviction_lock.lock();
        let mut evicted = Vec::new();
        loop {
            let (count, bytes) = self.usage();
            let pressure = if count > self.config.max_cache_size {
                EvictionReason::EntryLimit
            } else if bytes > self.max_memory_bytes {
                EvictionReason::MemoryLimit
            } else {
                break;
            };

            match self.pick_victim(protected) {
                Some(victim) => {
                    let reason = if victim.expired {
                        EvictionReason::Expired
                    } else {
                        pressure
                    };
                    evicted.extend(self.evict(&victim.key, reason));
                }
                None => {
                    warn!(
                        key = protected,
                        budget_bytes = self.max_memory_bytes,
                        "snapshot alone exceeds cache budget, evicting it"
                    );
                    evicted.extend(self.evict(protected, pressure));
                    break;
                }
            }
        }
        evicted
    }

    /// Expired entries first, then the least recently used one
    fn pick_victim(&self, protected: &str) -> Option<Victim> {
        let now = Instant::now();
        let mut lru: Option<(u64, String)> = None;

        for entry in self.entries.iter() {
            if entry.key() == protected {
                continue;
            }
            if entry.is_expired(now) {
                return Some(Victim {
                    key: entry.key().clone(),
                    expired: true,
                });
            }
            let tick = entry.last_access.load(Ordering::Relaxed);
            if lru.as_ref().map_or(true, |(oldest, _)| tick < *oldest) {
                lru = Some((tick, entry.key().clone()));
            }
        }

        lru.map(|(_, key)| Victim {
            key,
            expired: false,
        })
    }

    fn evict(&self, key: &str, reason: EvictionReason) -> Option<(String, Arc<V>, EvictionReason)> {
        let (key, entry) = self.entries.remove(key)?;
        self.counters.record_eviction();
        debug!(key = %key, ?reason, size = entry.size_estimate, "evicted snapshot");
        Some((key, entry.value, reason))
    }

    /// Invoke the eviction listener, containing panics
    fn notify(&self, key: &str, value: &Arc<V>, reason: EvictionReason) {
        if let Some(listener) = &self.listener {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(key, value, reason)));
            if outcome.is_err() {
                warn!(key, ?reason, "eviction listener panicked");
            }
        }
    }
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        Err(CacheError::InvalidKey)
    } else {
        Ok(())
    }
}

/// Handle to the background compaction task
pub struct CompactionHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl CompactionHandle {
    /// Stop the sweep and wait for the task to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "cache compaction task ended abnormally");
            }
        }
    }

    /// Whether the task is still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for CompactionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
