//! Bucket table: the cache seen by storage callers.
//!
//! A fixed power-of-two array of independently locked buckets, addressed by
//! the upper hash bits. Insertion is best-effort under a small lock budget;
//! banishment blocks, because an invalidation that silently fails would be
//! a correctness bug rather than a missed optimization.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::bucket::CacheBucket;
use crate::value::CachedValue;

/// Default try-lock budget for best-effort operations, in microseconds.
const DEFAULT_LOCK_BUDGET_MICROS: i64 = 10;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of buckets; rounded up to a power of two, minimum 1.
    pub bucket_count: usize,
    /// Soft memory ceiling in bytes (0 = unlimited). Enforced by evicting
    /// from the target bucket on insert.
    pub memory_limit: usize,
    /// Spin budget for best-effort bucket locking, in microseconds.
    pub lock_budget_micros: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bucket_count: 64,
            memory_limit: 0,
            lock_budget_micros: DEFAULT_LOCK_BUDGET_MICROS,
        }
    }
}

/// Hit/miss statistics for one cache.
#[derive(Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    insert_drops: AtomicU64,
    evictions: AtomicU64,
    banishes: AtomicU64,
}

impl CacheMetrics {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn insert_drops(&self) -> u64 {
        self.insert_drops.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn banishes(&self) -> u64 {
        self.banishes.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Get metrics as a JSON-serializable snapshot
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "hits": self.hits(),
            "misses": self.misses(),
            "hit_rate": self.hit_rate(),
            "inserts": self.inserts(),
            "insert_drops": self.insert_drops(),
            "evictions": self.evictions(),
            "banishes": self.banishes(),
        })
    }
}

/// A cache: fixed table of buckets plus memory accounting.
pub struct Cache {
    buckets: Box<[CacheBucket]>,
    /// Right-shift applied to a hash to produce a bucket index (upper-bit
    /// addressing, so the low bits stay useful inside the bucket).
    shift: u32,
    memory_limit: AtomicUsize,
    lock_budget_micros: i64,
    usage: AtomicUsize,
    metrics: CacheMetrics,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        let bucket_count = config.bucket_count.max(1).next_power_of_two();
        let buckets: Box<[CacheBucket]> =
            (0..bucket_count).map(|_| CacheBucket::new()).collect();
        tracing::debug!(
            "Initializing cache: {} buckets, memory limit {}",
            bucket_count,
            config.memory_limit
        );
        Self {
            buckets,
            shift: 32 - bucket_count.trailing_zeros(),
            memory_limit: AtomicUsize::new(config.memory_limit),
            lock_budget_micros: config.lock_budget_micros,
            usage: AtomicUsize::new(0),
            metrics: CacheMetrics::default(),
        }
    }

    fn bucket_for(&self, hash: u32) -> &CacheBucket {
        let index = if self.shift >= 32 {
            0
        } else {
            (hash >> self.shift) as usize
        };
        &self.buckets[index]
    }

    /// Best-effort insertion. Returns `false` when the bucket lock could
    /// not be taken within budget, the key is currently banished, or the
    /// record could not be placed; callers must tolerate misses either way.
    pub fn insert(&self, hash: u32, key: &[u8], value: &[u8]) -> bool {
        let record = Arc::new(CachedValue::new(key, value));
        let size = record.size();

        let Some(mut guard) = self.bucket_for(hash).lock(self.lock_budget_micros) else {
            self.metrics.insert_drops.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if guard.is_banished(hash) {
            self.metrics.insert_drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // Make room: first against the cache-wide memory ceiling, then
        // against the bucket's own capacity. Eviction is local to this
        // bucket; the rebalancer handles cross-cache pressure.
        let limit = self.memory_limit.load(Ordering::Relaxed);
        if limit > 0 {
            while self.usage.load(Ordering::Relaxed) + size > limit {
                let freed = guard.evict_candidate();
                if freed == 0 {
                    break;
                }
                self.usage.fetch_sub(freed, Ordering::Relaxed);
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        if guard.is_full() {
            let freed = guard.evict_candidate();
            self.usage.fetch_sub(freed, Ordering::Relaxed);
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        }

        if guard.insert(hash, record) {
            self.usage.fetch_add(size, Ordering::Relaxed);
            self.metrics.inserts.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.metrics.insert_drops.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Look up a record; hits are promoted to most-recently-used. A lock
    /// miss counts as a cache miss.
    pub fn find(&self, hash: u32, key: &[u8]) -> Option<Arc<CachedValue>> {
        let result = self
            .bucket_for(hash)
            .lock(self.lock_budget_micros)
            .and_then(|mut guard| guard.find(hash, key, true));
        match &result {
            Some(_) => self.metrics.hits.fetch_add(1, Ordering::Relaxed),
            None => self.metrics.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Remove a record, transferring ownership to the caller.
    pub fn remove(&self, hash: u32, key: &[u8]) -> Option<Arc<CachedValue>> {
        let mut guard = self.bucket_for(hash).lock(self.lock_budget_micros)?;
        let removed = guard.remove(hash, key);
        if let Some(record) = &removed {
            self.usage.fetch_sub(record.size(), Ordering::Relaxed);
        }
        removed
    }

    /// Banish a key: remove any resident record and guarantee subsequent
    /// finds miss until the banish term advances. Blocks on the bucket
    /// lock; invalidation must not fail silently.
    pub fn banish(&self, hash: u32, key: &[u8]) -> Option<Arc<CachedValue>> {
        let mut guard = self.bucket_for(hash).lock_blocking();
        let removed = guard.banish(hash, key);
        if let Some(record) = &removed {
            self.usage.fetch_sub(record.size(), Ordering::Relaxed);
        }
        self.metrics.banishes.fetch_add(1, Ordering::Relaxed);
        removed
    }

    /// Advance the banish term on every bucket (a higher-level transaction
    /// epoch moved forward). All previously banished keys become cacheable
    /// again in O(buckets).
    pub fn advance_banish_term(&self, term: u64) {
        for bucket in self.buckets.iter() {
            bucket.lock_blocking().update_banish_term(term);
        }
    }

    /// Drop every resident record (cache teardown or migration).
    pub fn clear(&self) {
        let mut freed = 0;
        for bucket in self.buckets.iter() {
            freed += bucket.lock_blocking().clear();
        }
        self.usage.fetch_sub(freed, Ordering::Relaxed);
    }

    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit.load(Ordering::Relaxed)
    }

    /// Applied by the rebalancer; takes effect on subsequent inserts.
    pub fn set_memory_limit(&self, limit: usize) {
        self.memory_limit.store(limit, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "buckets": self.buckets.len(),
            "usage": self.usage(),
            "memory_limit": self.memory_limit(),
            "metrics": self.metrics.to_json(),
        })
    }
}

/// Point-in-time usage of one cache, as seen by the rebalancer.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheUsage {
    pub usage: usize,
    pub limit: usize,
}

/// New memory ceiling for one cache.
#[derive(Debug, Clone, Copy)]
pub struct ResizeTask {
    pub cache_index: usize,
    pub new_limit: usize,
}

/// Manager seam: a global component that periodically inspects the usage of
/// all caches and redistributes memory between them. The bucket protocol
/// here is what it builds on; the policy itself lives with the manager.
pub trait Rebalancer: Send + Sync {
    fn plan(&self, usage: &[CacheUsage]) -> Vec<ResizeTask>;
}
