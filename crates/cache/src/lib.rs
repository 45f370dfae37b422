//! Transactional cache engine: fixed-capacity concurrent buckets with an
//! LRU recency order and a versioned banish protocol.
//!
//! Buckets are independent: each carries its own spin/try lock, so a large
//! table of them scales horizontally with no global lock. Banishing marks a
//! key as must-not-be-served after an invalidation; the scheme is
//! deliberately false-positive-safe (over-banishing is fine, under-banishing
//! would be a correctness bug).

pub mod bucket;
pub mod cache;
pub mod hash;
pub mod value;

pub use bucket::{BANISH_CAPACITY, BucketGuard, CacheBucket, SLOT_COUNT};
pub use cache::{Cache, CacheConfig, CacheMetrics, CacheUsage, Rebalancer, ResizeTask};
pub use value::CachedValue;
