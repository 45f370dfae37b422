//! Fixed-capacity concurrent cache bucket.
//!
//! Eight slots, an embedded recency order (index array, no heap-allocated
//! list nodes), and a small banish list versioned by a monotonic term. The
//! bucket is guarded by a word-sized spin/try lock; every operation goes
//! through [`BucketGuard`], so "caller must hold the lock" is a
//! compile-time property rather than a convention.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::value::CachedValue;

/// Slots per bucket.
pub const SLOT_COUNT: usize = 8;
/// Banished fingerprints representable per bucket; overflow degrades the
/// bucket to fully-banished until the term advances.
pub const BANISH_CAPACITY: usize = 4;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
/// Spin iterations between `yield_now` calls while waiting for the lock.
const SPINS_PER_YIELD: u32 = 64;

struct Slot {
    hash: u32,
    value: Arc<CachedValue>,
}

/// The data protected by the bucket lock. Obtained by dereferencing a
/// [`BucketGuard`].
pub struct BucketState {
    slots: [Option<Slot>; SLOT_COUNT],
    /// Slot indices ordered most- to least-recently used; the first
    /// `order_len` entries are live.
    order: [u8; SLOT_COUNT],
    order_len: u8,
    banish_term: u64,
    banished: [u32; BANISH_CAPACITY],
    banished_len: u8,
    fully_banished: bool,
}

impl BucketState {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            order: [0; SLOT_COUNT],
            order_len: 0,
            banish_term: 0,
            banished: [0; BANISH_CAPACITY],
            banished_len: 0,
            fully_banished: false,
        }
    }

    pub fn len(&self) -> usize {
        self.order_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.order_len == 0
    }

    pub fn is_full(&self) -> bool {
        self.order_len as usize == SLOT_COUNT
    }

    /// Place a record in a free slot and mark it most recently used.
    ///
    /// Best-effort: a full bucket drops the insertion and returns `false`.
    /// The bucket does not de-duplicate; callers that care should `find`
    /// first.
    pub fn insert(&mut self, hash: u32, value: Arc<CachedValue>) -> bool {
        if self.is_full() {
            return false;
        }
        let Some(free) = self.slots.iter().position(Option::is_none) else {
            return false;
        };
        self.slots[free] = Some(Slot { hash, value });
        let len = self.order_len as usize;
        for i in (0..len).rev() {
            self.order[i + 1] = self.order[i];
        }
        self.order[0] = free as u8;
        self.order_len += 1;
        true
    }

    /// Look up a resident record by hash and exact key bytes.
    ///
    /// Banished hashes always miss, including everything once the bucket is
    /// fully banished. A hit is promoted to most-recently-used unless
    /// `move_to_front` is off (scans that should not disturb recency).
    pub fn find(&mut self, hash: u32, key: &[u8], move_to_front: bool) -> Option<Arc<CachedValue>> {
        if self.is_banished(hash) {
            return None;
        }
        let pos = self.locate(hash, key)?;
        let value = {
            let slot_index = self.order[pos] as usize;
            let slot = self.slots[slot_index].as_ref()?;
            Arc::clone(&slot.value)
        };
        if move_to_front {
            self.touch(pos);
        }
        Some(value)
    }

    /// Remove a resident record, transferring the bucket's reference to the
    /// caller.
    pub fn remove(&mut self, hash: u32, key: &[u8]) -> Option<Arc<CachedValue>> {
        let pos = self.locate(hash, key)?;
        Some(self.take_at(pos).value)
    }

    /// Remove any matching resident record and record the hash fingerprint
    /// so future finds for it miss until the banish term advances.
    pub fn banish(&mut self, hash: u32, key: &[u8]) -> Option<Arc<CachedValue>> {
        let removed = self.remove(hash, key);
        if !self.fully_banished && !self.banished[..self.banished_len as usize].contains(&hash) {
            if (self.banished_len as usize) < BANISH_CAPACITY {
                self.banished[self.banished_len as usize] = hash;
                self.banished_len += 1;
            }
            if self.banished_len as usize == BANISH_CAPACITY {
                // The exact banish set can no longer grow; degrade to
                // treating everything as banished. Over-banishing is safe,
                // under-banishing is not.
                self.fully_banished = true;
            }
        }
        removed
    }

    /// True for exact fingerprints in the banish list, and for everything
    /// once the bucket is fully banished.
    pub fn is_banished(&self, hash: u32) -> bool {
        self.fully_banished || self.banished[..self.banished_len as usize].contains(&hash)
    }

    pub fn is_fully_banished(&self) -> bool {
        self.fully_banished
    }

    pub fn banish_term(&self) -> u64 {
        self.banish_term
    }

    /// Advance the banish term, invalidating the whole banish list in O(1).
    /// Stale (non-greater) terms are ignored.
    pub fn update_banish_term(&mut self, new_term: u64) {
        if new_term > self.banish_term {
            self.banish_term = new_term;
            self.banished_len = 0;
            self.fully_banished = false;
        }
    }

    /// The least-recently-used resident record, or `None` when empty.
    /// Banish state does not matter here; a banished-but-resident slot
    /// still occupies space.
    pub fn eviction_candidate(&self) -> Option<&Arc<CachedValue>> {
        if self.is_empty() {
            return None;
        }
        let slot_index = self.order[self.order_len as usize - 1] as usize;
        self.slots[slot_index].as_ref().map(|slot| &slot.value)
    }

    /// Evict the least-recently-used record and return the bytes reclaimed
    /// for memory accounting (0 when empty).
    pub fn evict_candidate(&mut self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let slot = self.take_at(self.order_len as usize - 1);
        slot.value.size()
    }

    /// Drop every resident record; returns the bytes reclaimed. The banish
    /// list is untouched (it describes keys, not slots).
    pub fn clear(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if let Some(slot) = slot.take() {
                freed += slot.value.size();
            }
        }
        self.order_len = 0;
        freed
    }

    /// Recency position of the record matching `hash` and `key`, front = 0.
    fn locate(&self, hash: u32, key: &[u8]) -> Option<usize> {
        for pos in 0..self.order_len as usize {
            let slot_index = self.order[pos] as usize;
            if let Some(slot) = &self.slots[slot_index] {
                if slot.hash == hash && slot.value.matches(key) {
                    return Some(pos);
                }
            }
        }
        None
    }

    /// Splice the record at recency position `pos` to the front.
    fn touch(&mut self, pos: usize) {
        let slot_index = self.order[pos];
        for i in (0..pos).rev() {
            self.order[i + 1] = self.order[i];
        }
        self.order[0] = slot_index;
    }

    fn take_at(&mut self, pos: usize) -> Slot {
        let slot_index = self.order[pos] as usize;
        let len = self.order_len as usize;
        for i in pos..len - 1 {
            self.order[i] = self.order[i + 1];
        }
        self.order_len -= 1;
        self.slots[slot_index]
            .take()
            .unwrap_or_else(|| unreachable!("recency order points at occupied slots"))
    }
}

/// One bucket: spin/try lock plus the slot state it protects.
pub struct CacheBucket {
    lock_word: AtomicU32,
    state: UnsafeCell<BucketState>,
}

// The lock word serializes all access to `state`.
unsafe impl Send for CacheBucket {}
unsafe impl Sync for CacheBucket {}

impl CacheBucket {
    pub fn new() -> Self {
        Self {
            lock_word: AtomicU32::new(UNLOCKED),
            state: UnsafeCell::new(BucketState::new()),
        }
    }

    /// Acquire exclusive access.
    ///
    /// `timeout_micros` semantics: `-1` blocks until acquired, `0` tries
    /// exactly once, a positive value retries for up to that many
    /// microseconds. `None` means the lock was not acquired; bucket state
    /// is untouched in that case.
    pub fn lock(&self, timeout_micros: i64) -> Option<BucketGuard<'_>> {
        if timeout_micros < 0 {
            return Some(self.lock_blocking());
        }
        if self.try_lock() {
            return Some(BucketGuard { bucket: self });
        }
        if timeout_micros == 0 {
            return None;
        }
        let deadline = Instant::now() + Duration::from_micros(timeout_micros as u64);
        let mut spins: u32 = 0;
        loop {
            if self.try_lock() {
                return Some(BucketGuard { bucket: self });
            }
            spins = spins.wrapping_add(1);
            if spins % SPINS_PER_YIELD == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    /// Acquire exclusive access, spinning until the lock is free. The
    /// infallible variant for operations that must not be dropped on
    /// contention (banishment, term advances, teardown).
    pub fn lock_blocking(&self) -> BucketGuard<'_> {
        let mut spins: u32 = 0;
        loop {
            if self.try_lock() {
                return BucketGuard { bucket: self };
            }
            spins = spins.wrapping_add(1);
            if spins % SPINS_PER_YIELD == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_word.load(Ordering::Relaxed) == LOCKED
    }

    fn try_lock(&self) -> bool {
        self.lock_word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for CacheBucket {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to a bucket's state; unlocks on drop.
pub struct BucketGuard<'a> {
    bucket: &'a CacheBucket,
}

impl Deref for BucketGuard<'_> {
    type Target = BucketState;

    fn deref(&self) -> &Self::Target {
        // Safety: the lock word is held for the guard's lifetime.
        unsafe { &*self.bucket.state.get() }
    }
}

impl DerefMut for BucketGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the lock word is held for the guard's lifetime.
        unsafe { &mut *self.bucket.state.get() }
    }
}

impl Drop for BucketGuard<'_> {
    fn drop(&mut self) {
        self.bucket.lock_word.store(UNLOCKED, Ordering::Release);
    }
}
