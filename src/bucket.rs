//! Buckets and their packed state word.
//!
//! State word layout (one `AtomicU64`):
//!
//! ```text
//!  63                              6   5   4   3  2   1  0
//! +---------------------------------+---+---+------+------+
//! |             version             | M | L | tomb | item |
//! +---------------------------------+---+---+------+------+
//! ```
//!
//! * `item` (bits 0-1): number of occupied inline slots; occupied slots are `0..item`.
//! * `tomb` (bits 2-3): overflow entries unlinked since the chain last drained, saturating.
//! * `L` (bit 4): lock bit, held by a writer, the growth migrator or a cursor.
//! * `M` (bit 5): set once growth has copied the bucket into a newer generation.
//! * `version` (bits 6-63): bumped on every structural mutation.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::backoff::Backoff;
use crate::extension::NIL;

/// Number of inline (key, value) slots per bucket
pub(crate) const BUCKET_ITEM_COUNT: usize = 3;

const ITEM_COUNT_MASK: u64 = 0b11;
const TOMBSTONE_SHIFT: u32 = 2;
const TOMBSTONE_MASK: u64 = 0b11 << TOMBSTONE_SHIFT;
const LOCK_BIT: u64 = 1 << 4;
const MOVED_BIT: u64 = 1 << 5;
const VERSION_SHIFT: u32 = 6;
const VERSION_INC: u64 = 1 << VERSION_SHIFT;

// ================================================================================================
// BUCKET STATE
// ================================================================================================

/// Snapshot of a bucket's state word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct BucketState(u64);

impl BucketState {
    #[inline(always)]
    pub(crate) fn item_count(self) -> usize {
        (self.0 & ITEM_COUNT_MASK) as usize
    }

    #[inline(always)]
    pub(crate) fn with_item_count(self, count: usize) -> Self {
        debug_assert!(count <= BUCKET_ITEM_COUNT);
        BucketState((self.0 & !ITEM_COUNT_MASK) | count as u64)
    }

    #[inline(always)]
    pub(crate) fn tombstones(self) -> u64 {
        (self.0 & TOMBSTONE_MASK) >> TOMBSTONE_SHIFT
    }

    /// One more overflow entry unlinked; saturates at 3.
    #[inline(always)]
    pub(crate) fn add_tombstone(self) -> Self {
        let count = (self.tombstones() + 1).min(TOMBSTONE_MASK >> TOMBSTONE_SHIFT);
        BucketState((self.0 & !TOMBSTONE_MASK) | (count << TOMBSTONE_SHIFT))
    }

    #[inline(always)]
    pub(crate) fn clear_tombstones(self) -> Self {
        BucketState(self.0 & !TOMBSTONE_MASK)
    }

    #[inline(always)]
    pub(crate) fn is_locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    #[inline(always)]
    pub(crate) fn is_moved(self) -> bool {
        self.0 & MOVED_BIT != 0
    }

    #[inline(always)]
    pub(crate) fn moved(self) -> Self {
        BucketState(self.0 | MOVED_BIT)
    }

    #[inline(always)]
    pub(crate) fn version(self) -> u64 {
        self.0 >> VERSION_SHIFT
    }

    /// Same fields, next version, lock bit clear.
    #[inline(always)]
    pub(crate) fn bumped(self) -> Self {
        BucketState((self.0 & !LOCK_BIT).wrapping_add(VERSION_INC))
    }

    #[inline(always)]
    fn locked(self) -> Self {
        BucketState(self.0 | LOCK_BIT)
    }

    #[inline(always)]
    fn unlocked(self) -> Self {
        BucketState(self.0 & !LOCK_BIT)
    }
}

impl std::fmt::Debug for BucketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketState")
            .field("items", &self.item_count())
            .field("tombstones", &self.tombstones())
            .field("locked", &self.is_locked())
            .field("moved", &self.is_moved())
            .field("version", &self.version())
            .finish()
    }
}

// ================================================================================================
// BUCKET
// ================================================================================================

/// Inline storage for three entries plus the head of an overflow chain.
///
/// Every field is atomic so optimistic readers never race with non-atomic writes; the
/// state word decides whether what they read is usable.
#[repr(align(64))]
pub(crate) struct Bucket {
    state: AtomicU64,
    head: AtomicU32,
    keys: [AtomicU64; BUCKET_ITEM_COUNT],
    values: [AtomicU64; BUCKET_ITEM_COUNT],
}

impl Bucket {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            head: AtomicU32::new(NIL),
            keys: std::array::from_fn(|_| AtomicU64::new(0)),
            values: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline(always)]
    pub(crate) fn state(&self, order: Ordering) -> BucketState {
        BucketState(self.state.load(order))
    }

    /// Spin until the lock bit is ours. Returns the state as it was before locking.
    #[inline(always)]
    pub(crate) fn lock<B: Backoff>(&self) -> BucketState {
        let mut backoff = B::default();
        loop {
            let cur = BucketState(self.state.load(Ordering::Relaxed));
            if !cur.is_locked()
                && self
                    .state
                    .compare_exchange_weak(
                        cur.0,
                        cur.locked().0,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                // Slot stores that follow must not become visible before the lock bit.
                fence(Ordering::Release);
                return cur;
            }
            backoff.backoff();
        }
    }

    /// Release the lock without a structural change.
    #[inline(always)]
    pub(crate) fn unlock(&self, state: BucketState) {
        self.state.store(state.unlocked().0, Ordering::Release);
    }

    /// Release the lock and publish `state` with a fresh version.
    #[inline(always)]
    pub(crate) fn publish(&self, state: BucketState) {
        self.state.store(state.bumped().0, Ordering::Release);
    }

    /// Record `state` while keeping the lock; used by cursors that mutate in place.
    #[inline(always)]
    pub(crate) fn store_locked(&self, state: BucketState) {
        self.state.store(state.locked().0, Ordering::Relaxed);
    }

    /// Seqlock validation: true if nothing was published since `state` was read.
    #[inline(always)]
    pub(crate) fn validate(&self, state: BucketState) -> bool {
        fence(Ordering::Acquire);
        self.state.load(Ordering::Relaxed) == state.0
    }

    #[inline(always)]
    pub(crate) fn key(&self, slot: usize) -> u64 {
        self.keys[slot].load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn value(&self, slot: usize) -> u64 {
        self.values[slot].load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn set_slot(&self, slot: usize, key: u64, value: u64) {
        self.keys[slot].store(key, Ordering::Relaxed);
        self.values[slot].store(value, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn head(&self, order: Ordering) -> u32 {
        self.head.load(order)
    }

    #[inline(always)]
    pub(crate) fn set_head(&self, item: u32) {
        self.head.store(item, Ordering::Release);
    }

    /// Overwrite the state of a bucket nobody else can see yet.
    #[inline(always)]
    pub(crate) fn init_state(&self, state: BucketState) {
        self.state.store(state.0, Ordering::Relaxed);
    }
}
