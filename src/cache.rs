/*!
 * Bounded, TTL'd result cache
 *
 * Holds query results of any type keyed by string. Entries expire a fixed
 * time after creation and are removed lazily on access or by the periodic
 * sweep. When an insert would exceed the entry or byte bound, the
 * least-recently-accessed 20% of entries are evicted in one batch.
 *
 * Sizes are estimated from the JSON encoding of the value; an estimate that
 * cannot be computed counts as zero.
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::EstimationError;

/// Fraction of entries removed by one eviction batch
const EVICTION_FRACTION: f64 = 0.2;

pub(crate) type SharedValue = Arc<dyn Any + Send + Sync>;

struct CacheEntry {
    value: SharedValue,
    created_at: Instant,
    last_accessed_at: Instant,
    /// Logical access clock; orders entries even when `Instant`s tie
    last_access_seq: u64,
    access_count: u64,
    size_bytes: usize,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }

    fn touch(&mut self, now: Instant, seq: u64) {
        self.last_accessed_at = now;
        self.last_access_seq = seq;
        self.access_count += 1;
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub default_ttl: Duration,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
    max_entries: usize,
    max_bytes: usize,
    default_ttl: Duration,
    access_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
}

impl CacheInner {
    fn next_seq(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Remove the least-recently-accessed 20% (at least one)
    fn evict_batch(&mut self) -> usize {
        let count = ((self.entries.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);

        let mut by_recency: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.last_access_seq, k.clone()))
            .collect();
        by_recency.sort_unstable_by_key(|(seq, _)| *seq);

        let mut evicted = 0;
        for (_, key) in by_recency.into_iter().take(count) {
            if self.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions += evicted as u64;
        evicted
    }

    /// Evict until `extra_entries` more entries of `extra_bytes` fit
    fn make_room(&mut self, extra_entries: usize, extra_bytes: usize) {
        while !self.entries.is_empty()
            && (self.entries.len() + extra_entries > self.max_entries
                || self.total_bytes + extra_bytes > self.max_bytes)
        {
            let evicted = self.evict_batch();
            debug!(
                evicted,
                remaining = self.entries.len(),
                bytes = self.total_bytes,
                "Evicted least-recently-used cache entries"
            );
        }
    }
}

/// Heterogeneous result cache
pub struct ResultCache {
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    pub fn new(max_entries: usize, max_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_bytes: 0,
                max_entries: max_entries.max(1),
                max_bytes,
                default_ttl,
                access_seq: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                invalidations: 0,
            }),
        }
    }

    /// Look up a value. A missing, expired or differently-typed entry is a miss.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(key);
            inner.expirations += 1;
            inner.misses += 1;
            trace!(key, "Cache entry expired on access");
            return None;
        }

        let seq = inner.next_seq();
        let value = inner.entries.get_mut(key).and_then(|entry| {
            let value = entry.value.downcast_ref::<T>().cloned();
            if value.is_some() {
                entry.touch(now, seq);
            }
            value
        });

        if value.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
            debug!(key, "Cached value has a different type, treating as miss");
        }
        value
    }

    /// Store a value, evicting old entries first if a bound would be exceeded.
    ///
    /// A value whose estimated size alone exceeds the byte bound is not cached.
    pub fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let size = match estimate_bytes(&value) {
            Ok(size) => size,
            Err(e) => {
                debug!(key, error = %e, "Cache size estimate failed, counting as zero");
                0
            }
        };
        self.insert(key, Arc::new(value), size, ttl);
    }

    pub(crate) fn insert(
        &self,
        key: &str,
        value: SharedValue,
        size_bytes: usize,
        ttl: Option<Duration>,
    ) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if size_bytes > inner.max_bytes {
            debug!(
                key,
                size_bytes,
                max_bytes = inner.max_bytes,
                "Value larger than cache byte bound, not cached"
            );
            return;
        }

        inner.remove(key);
        inner.make_room(1, size_bytes);

        let ttl = ttl.unwrap_or(inner.default_ttl);
        let seq = inner.next_seq();
        inner.total_bytes += size_bytes;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                last_accessed_at: now,
                last_access_seq: seq,
                access_count: 0,
                size_bytes,
                ttl,
            },
        );
    }

    /// Remove every entry whose key contains `pattern`. Returns the number removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.contains(pattern))
            .cloned()
            .collect();

        for key in &keys {
            inner.remove(key);
        }
        inner.invalidations += keys.len() as u64;

        if !keys.is_empty() {
            debug!(pattern, removed = keys.len(), "Invalidated cache entries");
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    /// TTL applied to entries stored without an override from now on
    pub fn set_default_ttl(&self, ttl: Duration) {
        self.inner.lock().default_ttl = ttl;
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.lock().default_ttl
    }

    /// Change the bounds; shrinking evicts immediately.
    pub fn set_limits(&self, max_entries: usize, max_bytes: usize) {
        let mut inner = self.inner.lock();
        inner.max_entries = max_entries.max(1);
        inner.max_bytes = max_bytes;
        inner.make_room(0, 0);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// How often a live entry has been read, if present
    pub fn access_count(&self, key: &str) -> Option<u64> {
        self.inner.lock().entries.get(key).map(|e| e.access_count)
    }

    /// Time since a live entry was last read or written, if present
    pub fn idle_for(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|e| now.saturating_duration_since(e.last_accessed_at))
    }

    pub fn metrics(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.total_bytes,
            max_entries: inner.max_entries,
            max_bytes: inner.max_bytes,
            default_ttl: inner.default_ttl,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            invalidations: inner.invalidations,
        }
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ResultCache")
            .field("entries", &inner.entries.len())
            .field("bytes", &inner.total_bytes)
            .finish()
    }
}

pub(crate) fn estimate_bytes<T: Serialize + ?Sized>(value: &T) -> Result<usize, EstimationError> {
    Ok(serde_json::to_vec(value)?.len())
}
