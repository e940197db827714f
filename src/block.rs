//! One generation of the table: a power-of-two bucket array plus its extension slabs.
//!
//! Everything here operates on raw `u64` bits; typing, hashing and reclamation are the
//! map's business.

use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::bucket::{Bucket, BucketState, BUCKET_ITEM_COUNT};
use crate::extension::{
    build_slabs, slab_count, slab_of_item, ExtensionItem, Slab, BUCKETS_PER_SLAB, NIL,
};

/// Where an entry sits inside its bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Position {
    Inline(usize),
    /// `prev` is the chain predecessor, or `NIL` when `item` is the chain head.
    Chain { prev: u32, item: u32 },
}

/// Outcome of an optimistic scan; only trustworthy once the bucket state validates.
pub(crate) enum Scan {
    Found(u64),
    Missing,
    /// The chain walk exceeded what any consistent chain could hold.
    Interfered,
}

pub(crate) struct Block {
    buckets: Box<[Bucket]>,
    items: Box<[ExtensionItem]>,
    slabs: Box<[CachePadded<Slab>]>,
    mask: usize,
}

impl Block {
    pub(crate) fn new(bucket_count: usize) -> Self {
        debug_assert!(bucket_count.is_power_of_two());
        let buckets = (0..bucket_count)
            .map(|_| Bucket::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let (items, slabs) = build_slabs(slab_count(bucket_count));
        let slabs = slabs
            .into_vec()
            .into_iter()
            .map(CachePadded::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            items,
            slabs,
            mask: bucket_count - 1,
        }
    }

    #[inline(always)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.mask + 1
    }

    #[inline(always)]
    pub(crate) fn index(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    #[inline(always)]
    pub(crate) fn bucket(&self, index: usize) -> &Bucket {
        &self.buckets[index]
    }

    #[inline(always)]
    pub(crate) fn item(&self, item: u32) -> &ExtensionItem {
        &self.items[item as usize]
    }

    // ============================================================================================
    // READ PATH
    // ============================================================================================

    /// Look for `key` without locking. The caller validates `state` afterwards.
    #[inline(always)]
    pub(crate) fn scan(&self, bucket: &Bucket, state: BucketState, key: u64) -> Scan {
        for slot in 0..state.item_count() {
            if bucket.key(slot) == key {
                return Scan::Found(bucket.value(slot));
            }
        }

        let mut hops = 0;
        let mut cur = bucket.head(Ordering::Acquire);
        while cur != NIL {
            if hops == self.items.len() {
                return Scan::Interfered;
            }
            hops += 1;
            let item = self.item(cur);
            if item.key() == key {
                return Scan::Found(item.value());
            }
            cur = item.next(Ordering::Acquire);
        }
        Scan::Missing
    }

    // ============================================================================================
    // LOCKED PATH
    // ============================================================================================

    /// Find `key` in a bucket whose lock the caller holds.
    pub(crate) fn find_locked(&self, bucket: &Bucket, state: BucketState, key: u64) -> Option<Position> {
        for slot in 0..state.item_count() {
            if bucket.key(slot) == key {
                return Some(Position::Inline(slot));
            }
        }
        let mut prev = NIL;
        let mut cur = bucket.head(Ordering::Relaxed);
        while cur != NIL {
            let item = self.item(cur);
            if item.key() == key {
                return Some(Position::Chain { prev, item: cur });
            }
            prev = cur;
            cur = item.next(Ordering::Relaxed);
        }
        None
    }

    /// Visit every entry of a locked (or unpublished) bucket, inline slots first.
    pub(crate) fn for_each_entry<F: FnMut(u64, u64)>(&self, bucket: &Bucket, state: BucketState, mut f: F) {
        for slot in 0..state.item_count() {
            f(bucket.key(slot), bucket.value(slot));
        }
        let mut cur = bucket.head(Ordering::Relaxed);
        while cur != NIL {
            let item = self.item(cur);
            f(item.key(), item.value());
            cur = item.next(Ordering::Relaxed);
        }
    }

    /// Number of chained overflow entries in a locked bucket.
    #[cfg(test)]
    fn chain_len(&self, bucket: &Bucket) -> usize {
        let mut len = 0;
        let mut cur = bucket.head(Ordering::Relaxed);
        while cur != NIL {
            len += 1;
            cur = self.item(cur).next(Ordering::Relaxed);
        }
        len
    }

    /// Store a new entry in the locked bucket at `index`. Returns the state to publish, or
    /// `None` when the bucket is full and its slab range has no free item.
    ///
    /// `keeps_together` is consulted only in that last case; if it reports that the next
    /// doubling would leave the bucket whole, an item is borrowed from another slab instead.
    pub(crate) fn insert_locked<B: Backoff>(
        &self,
        index: usize,
        state: BucketState,
        key: u64,
        value: u64,
        keeps_together: impl FnOnce() -> bool,
    ) -> Option<BucketState> {
        let bucket = self.bucket(index);
        let count = state.item_count();
        if count < BUCKET_ITEM_COUNT {
            bucket.set_slot(count, key, value);
            return Some(state.with_item_count(count + 1));
        }

        let item = match self.slabs[index / BUCKETS_PER_SLAB].allocate::<B>(&self.items) {
            Some(item) => item,
            None if keeps_together() => self.borrow_item::<B>(index)?,
            None => return None,
        };
        self.item(item).fill(key, value, bucket.head(Ordering::Relaxed));
        bucket.set_head(item);
        Some(state)
    }

    /// Take an item from any slab other than the one covering `index`.
    fn borrow_item<B: Backoff>(&self, index: usize) -> Option<u32> {
        let own = index / BUCKETS_PER_SLAB;
        let count = self.slabs.len();
        let item = (1..count)
            .map(|offset| (own + offset) % count)
            .find_map(|s| self.slabs[s].allocate::<B>(&self.items));

        #[cfg(feature = "tracing")]
        tracing::trace!(bucket = index, borrowed = ?item, "overflow item borrowed from foreign slab");

        item
    }

    /// Unlink the entry at `pos` from a locked bucket. Returns the state to publish and
    /// the removed value bits.
    ///
    /// An inline hole is refilled from the chain head if there is one, otherwise from the
    /// last inline slot, so occupied inline slots stay contiguous.
    pub(crate) fn remove_locked<B: Backoff>(
        &self,
        bucket: &Bucket,
        state: BucketState,
        pos: Position,
    ) -> (BucketState, u64) {
        let (mut state, value) = match pos {
            Position::Inline(slot) => {
                let value = bucket.value(slot);
                let head = bucket.head(Ordering::Relaxed);
                if head != NIL {
                    let item = self.item(head);
                    bucket.set_slot(slot, item.key(), item.value());
                    bucket.set_head(item.next(Ordering::Relaxed));
                    self.free_item::<B>(head);
                    (state, value)
                } else {
                    let last = state.item_count() - 1;
                    if slot != last {
                        bucket.set_slot(slot, bucket.key(last), bucket.value(last));
                    }
                    (state.with_item_count(last), value)
                }
            }
            Position::Chain { prev, item } => {
                let removed = self.item(item);
                let value = removed.value();
                let next = removed.next(Ordering::Relaxed);
                if prev == NIL {
                    bucket.set_head(next);
                } else {
                    self.item(prev).set_next(next);
                }
                self.free_item::<B>(item);
                (state.add_tombstone(), value)
            }
        };
        if bucket.head(Ordering::Relaxed) == NIL {
            state = state.clear_tombstones();
        }
        (state, value)
    }

    #[inline(always)]
    fn free_item<B: Backoff>(&self, item: u32) {
        self.slabs[slab_of_item(item)].free::<B>(&self.items, item);
    }

    // ============================================================================================
    // MIGRATION
    // ============================================================================================

    /// Append an entry to a generation that has not been published yet.
    ///
    /// Never fails: a generation built by doubling has twice the overflow capacity of the
    /// one being drained, and borrowing is always allowed here.
    pub(crate) fn push_unpublished<B: Backoff>(&self, hash: u64, key: u64, value: u64) {
        let index = self.index(hash);
        let bucket = self.bucket(index);
        let state = bucket.state(Ordering::Relaxed);
        match self.insert_locked::<B>(index, state, key, value, || true) {
            Some(next) => bucket.init_state(next),
            None => unreachable!("grown generation ran out of overflow items"),
        }
    }
}
