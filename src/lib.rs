//! VyukovMap: a concurrent hash map for word-sized keys and values with per-bucket
//! locking for writers and lock-free, seqlock-validated reads.
//!
//! * Lookups never take a lock: they read a bucket optimistically and retry if its state
//!   word changed underneath them.
//! * Inserts and removals lock a single bucket.
//! * Each bucket stores three entries inline and chains further entries from a fixed
//!   per-range slab; an exhausted slab doubles the table online. Superseded generations
//!   are reclaimed through `crossbeam-epoch`.
//!
//! ```
//! use vyukovmap_rs::VyukovMap;
//!
//! let map = VyukovMap::new();
//! assert!(map.emplace(7u64, 70u64));
//! assert!(!map.emplace(7, 71));
//! assert_eq!(map.try_get(&7), Some(70));
//! assert_eq!(map.extract(&7), Some(70));
//! assert!(!map.contains(&7));
//! ```

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use ahash::RandomState;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

mod backoff;
mod block;
mod bucket;
mod cursor;
mod extension;
mod word;

pub use crate::backoff::{Backoff, ExponentialBackoff, NoBackoff};
pub use crate::cursor::{Cursor, Iter};
pub use crate::word::{Managed, Value, Word};

use crate::block::{Block, Scan};
use crate::bucket::BucketState;

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Default number of buckets in a fresh map
const DEFAULT_CAPACITY: usize = 128;

// ================================================================================================
// MAIN STRUCTURE
// ================================================================================================

/// Concurrent hash map with bucket-level write locks and lock-free reads.
///
/// Keys must be [`Word`]s; values are [`Word`]s or [`Managed`] heap values. `S` hashes keys
/// and `B` is the backoff used by every spin loop.
pub struct VyukovMap<K, V: Value, S = RandomState, B = ExponentialBackoff> {
    block: CachePadded<Atomic<Block>>,
    resize_lock: CachePadded<AtomicBool>,
    len: CachePadded<AtomicUsize>,
    hasher: S,
    _marker: PhantomData<(K, V, fn() -> B)>,
}

// ================================================================================================
// CONSTRUCTORS
// ================================================================================================

impl<K, V> VyukovMap<K, V, RandomState, ExponentialBackoff>
where
    K: Word + Hash + Eq,
    V: Value,
{
    /// Create a map with 128 buckets.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a map with `capacity` buckets, rounded up to a power of two.
    ///
    /// Each bucket holds three entries inline, so `capacity` buckets take roughly
    /// `3 * capacity` entries before the first growth.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, S, B> VyukovMap<K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher,
    B: Backoff,
{
    /// Create a map with the default bucket count and the given hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_CAPACITY, hasher)
    }

    /// Create a map with `capacity` buckets (rounded up to a power of two) and `hasher`.
    ///
    /// The hasher cannot be changed later: it decides bucket placement for every entry.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = <K as Word>::ASSERT_WIDTH;
        #[allow(clippy::let_unit_value)]
        let () = <V as Value>::ASSERT_WIDTH;

        let bucket_count = capacity.max(1).next_power_of_two();
        Self {
            block: CachePadded::new(Atomic::new(Block::new(bucket_count))),
            resize_lock: CachePadded::new(AtomicBool::new(false)),
            len: CachePadded::new(AtomicUsize::new(0)),
            hasher,
            _marker: PhantomData,
        }
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Insert `key` -> `value` if `key` is absent.
    ///
    /// Returns `false` and leaves the map untouched if the key is already present; the
    /// rejected value is dropped.
    pub fn emplace(&self, key: K, value: V) -> bool {
        let hash = self.hash(&key);
        let bits = key.into_bits();
        let raw = value.into_raw();
        let guard = epoch::pin();

        loop {
            let (block, index, state) = self.lock_bucket(hash, &guard);
            let bucket = block.bucket(index);

            if block.find_locked(bucket, state, bits).is_some() {
                bucket.unlock(state);
                // SAFETY: `raw` was never published.
                unsafe { V::drop_raw(raw) };
                return false;
            }

            let inserted = block.insert_locked::<B>(index, state, bits, raw, || {
                self.doubling_keeps_together(block, index, state, hash)
            });
            match inserted {
                Some(next) => {
                    // Counted before the publish so a racing removal cannot underflow.
                    self.len.fetch_add(1, Ordering::Relaxed);
                    bucket.publish(next);
                    return true;
                }
                None => {
                    bucket.unlock(state);
                    self.grow(block, &guard);
                }
            }
        }
    }

    /// Remove `key` and return its value.
    pub fn extract(&self, key: &K) -> Option<V>
    where
        V: Word,
    {
        let guard = epoch::pin();
        self.extract_raw(key, &guard).map(<V as Word>::from_bits)
    }

    /// Remove `key` and return its value borrowed from `guard`.
    ///
    /// For [`Managed`] values the returned reference stays valid for as long as `guard` is
    /// held; the value itself is reclaimed afterwards.
    ///
    /// # Panics
    ///
    /// If `guard` was not obtained from `crossbeam_epoch::pin()`.
    pub fn extract_in<'g>(&self, key: &K, guard: &'g Guard) -> Option<V::Read<'g>> {
        check_guard(guard);
        let raw = self.extract_raw(key, guard)?;
        // SAFETY: the entry is unlinked and published; retiring defers past `guard`.
        unsafe {
            V::retire(raw, guard);
            Some(V::read(raw, guard))
        }
    }

    /// Remove `key`. Returns whether it was present.
    pub fn erase(&self, key: &K) -> bool {
        let guard = epoch::pin();
        match self.extract_raw(key, &guard) {
            Some(raw) => {
                // SAFETY: the entry is unlinked and published.
                unsafe { V::retire(raw, &guard) };
                true
            }
            None => false,
        }
    }

    /// Look up `key` without taking any lock.
    pub fn try_get(&self, key: &K) -> Option<V>
    where
        V: Word,
    {
        let guard = epoch::pin();
        self.find_raw(key, &guard).map(<V as Word>::from_bits)
    }

    /// Look up `key` without taking any lock, borrowing the value from `guard`.
    ///
    /// # Panics
    ///
    /// If `guard` was not obtained from `crossbeam_epoch::pin()`.
    pub fn get_in<'g>(&self, key: &K, guard: &'g Guard) -> Option<V::Read<'g>> {
        check_guard(guard);
        let raw = self.find_raw(key, guard)?;
        // SAFETY: the value was live when the read validated and cannot be reclaimed
        // before `guard` is released.
        Some(unsafe { V::read(raw, guard) })
    }

    /// Check whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        let guard = epoch::pin();
        self.find_raw(key, &guard).is_some()
    }

    /// A cursor positioned on the first entry, or at the end if the map is empty.
    ///
    /// While positioned, the cursor holds the lock of its bucket, so lookups of keys in that
    /// bucket wait for it to move on. Do not mutate the map through other methods from the
    /// same thread while a cursor is alive.
    pub fn begin(&self) -> Cursor<'_, K, V, S, B> {
        Cursor::begin(self)
    }

    /// The past-the-end cursor.
    pub fn end(&self) -> Cursor<'_, K, V, S, B> {
        Cursor::end(self)
    }

    /// Iterate over `(key, value)` pairs.
    ///
    /// Entries are copied out one bucket at a time; no lock is held between calls to
    /// `next`. Weakly consistent: concurrent changes may or may not be observed.
    pub fn iter(&self) -> Iter<'_, K, V, S, B>
    where
        V: Word,
    {
        Iter::new(self)
    }

    /// Number of entries. Exact when no writer is active.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns true if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buckets in the current generation.
    pub fn bucket_count(&self) -> usize {
        let guard = epoch::pin();
        self.current(&guard).bucket_count()
    }

    // ============================================================================================
    // PRIVATE HELPER METHODS
    // ============================================================================================

    #[inline(always)]
    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline(always)]
    pub(crate) fn current<'g>(&self, guard: &'g Guard) -> &'g Block {
        let shared = self.block.load(Ordering::Acquire, guard);
        // SAFETY: the generation is only null during drop, and retired generations stay
        // allocated while `guard` is pinned.
        unsafe { shared.deref() }
    }

    /// Lock the bucket for `hash` in the generation that currently owns it.
    ///
    /// A bucket already migrated by growth is released again and the call waits for the
    /// new generation to be published.
    fn lock_bucket<'g>(&self, hash: u64, guard: &'g Guard) -> (&'g Block, usize, BucketState) {
        loop {
            let shared = self.block.load(Ordering::Acquire, guard);
            // SAFETY: see `current`.
            let block = unsafe { shared.deref() };
            let index = block.index(hash);
            let bucket = block.bucket(index);
            let state = bucket.lock::<B>();
            if !state.is_moved() {
                return (block, index, state);
            }
            bucket.unlock(state);
            self.wait_for_publish(shared, guard);
        }
    }

    fn wait_for_publish(&self, old: Shared<'_, Block>, guard: &Guard) {
        let mut backoff = B::default();
        while self.block.load(Ordering::Acquire, guard) == old {
            backoff.backoff();
        }
    }

    /// Seqlock read of the value bits stored for `key`.
    fn find_raw(&self, key: &K, guard: &Guard) -> Option<u64> {
        let hash = self.hash(key);
        let bits = key.into_bits();
        let mut backoff = B::default();

        loop {
            let block = self.current(guard);
            let bucket = block.bucket(block.index(hash));
            let state = bucket.state(Ordering::Acquire);
            if !state.is_locked() {
                let scan = block.scan(bucket, state, bits);
                if bucket.validate(state) {
                    match scan {
                        Scan::Found(raw) => return Some(raw),
                        Scan::Missing => return None,
                        Scan::Interfered => {}
                    }
                }
            }
            backoff.backoff();
        }
    }

    /// Unlink `key` under its bucket lock and return the value bits. The caller retires
    /// or returns them.
    fn extract_raw(&self, key: &K, guard: &Guard) -> Option<u64> {
        let hash = self.hash(key);
        let bits = key.into_bits();
        let (block, index, state) = self.lock_bucket(hash, guard);
        let bucket = block.bucket(index);

        match block.find_locked(bucket, state, bits) {
            Some(pos) => {
                let (next, raw) = block.remove_locked::<B>(bucket, state, pos);
                bucket.publish(next);
                self.len.fetch_sub(1, Ordering::Relaxed);
                Some(raw)
            }
            None => {
                bucket.unlock(state);
                None
            }
        }
    }

    /// True if the next doubling would put every entry of the full bucket at `index`,
    /// together with a new key hashing to `hash`, into one bucket again.
    ///
    /// A doubled table indexes one more hash bit, the one equal to the current bucket
    /// count, so only that bit decides whether the bucket splits.
    #[cold]
    fn doubling_keeps_together(
        &self,
        block: &Block,
        index: usize,
        state: BucketState,
        hash: u64,
    ) -> bool {
        let split_bit = block.bucket_count() as u64;
        let mut together = true;
        block.for_each_entry(block.bucket(index), state, |key, _| {
            together &= (self.hash(&K::from_bits(key)) ^ hash) & split_bit == 0;
        });
        together
    }

    /// Double the table, or wait for the thread that is already doing so.
    ///
    /// `full` is the generation the caller failed to insert into; if it is no longer
    /// current another growth already happened and nothing is done.
    #[cold]
    fn grow(&self, full: &Block, guard: &Guard) {
        if self
            .resize_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            let mut backoff = B::default();
            while self.resize_lock.load(Ordering::Acquire) {
                backoff.backoff();
            }
            return;
        }

        let old = self.current(guard);
        if !ptr::eq(old, full) {
            self.resize_lock.store(false, Ordering::Release);
            return;
        }

        let old_len = old.bucket_count();
        let new_block = Block::new(old_len << 1);

        #[cfg(feature = "tracing")]
        tracing::debug!(old_buckets = old_len, new_buckets = old_len << 1, "growth started");

        let mut migrated = 0usize;
        for index in 0..old_len {
            let bucket = old.bucket(index);
            let state = bucket.lock::<B>();
            old.for_each_entry(bucket, state, |key, raw| {
                let hash = self.hash(&K::from_bits(key));
                new_block.push_unpublished::<B>(hash, key, raw);
                migrated += 1;
            });
            bucket.publish(state.moved());
        }

        let retired = self.block.swap(Owned::new(new_block), Ordering::Release, guard);
        // SAFETY: every bucket of `retired` is marked moved and the generation is no longer
        // reachable from the map; readers still pinned on it keep it alive.
        unsafe { guard.defer_destroy(retired) };
        self.resize_lock.store(false, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::debug!(new_buckets = old_len << 1, migrated, "growth finished");
        #[cfg(not(feature = "tracing"))]
        let _ = migrated;
    }
}

/// Guard-scoped reads hand out references tied to the default epoch collector.
fn check_guard(guard: &Guard) {
    assert!(
        guard
            .collector()
            .is_some_and(|c| c == epoch::default_collector()),
        "guard must come from crossbeam_epoch::pin()"
    );
}

// ================================================================================================
// DROP IMPLEMENTATION
// ================================================================================================

impl<K, V: Value, S, B> Drop for VyukovMap<K, V, S, B> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the current generation.
        let guard = unsafe { epoch::unprotected() };
        let shared = self.block.swap(Shared::null(), Ordering::Relaxed, guard);
        if shared.is_null() {
            return;
        }
        // SAFETY: as above; retired generations are owned by the collector, not by us.
        let block = unsafe { shared.into_owned() };
        if mem::needs_drop::<V>() {
            for index in 0..block.bucket_count() {
                let bucket = block.bucket(index);
                block.for_each_entry(bucket, bucket.state(Ordering::Relaxed), |_, raw| {
                    // SAFETY: the map is the last owner of every value still stored.
                    unsafe { V::drop_raw(raw) }
                });
            }
        }
        drop(block);
    }
}

// ================================================================================================
// STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<K, V, S, B> Default for VyukovMap<K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher + Default,
    B: Backoff,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S, B> fmt::Debug for VyukovMap<K, V, S, B>
where
    K: Word + Hash + Eq + fmt::Debug,
    V: Word + fmt::Debug,
    S: BuildHasher,
    B: Backoff,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<'a, K, V, S, B> IntoIterator for &'a VyukovMap<K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Word,
    S: BuildHasher,
    B: Backoff,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, S, B>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Later duplicates of a key are ignored.
impl<K, V, S, B> FromIterator<(K, V)> for VyukovMap<K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher + Default,
    B: Backoff,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = Self::with_hasher(S::default());
        for (k, v) in iter {
            map.emplace(k, v);
        }
        map
    }
}

/// Keys already present keep their value.
impl<K, V, S, B> Extend<(K, V)> for VyukovMap<K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher,
    B: Backoff,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.emplace(k, v);
        }
    }
}
