//! Overflow entries and the fixed slabs they are drawn from.
//!
//! A generation owns one flat array of [`ExtensionItem`]s cut into slabs of
//! [`EXTENSION_ITEM_COUNT`] items; slab `s` owns indices `s * 10 .. s * 10 + 10` and covers
//! buckets `s * 128 .. s * 128 + 128`. Links are `u32` indices into that array so a stale
//! reader can never chase a pointer out of the generation it is pinned to.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::backoff::Backoff;

/// End-of-chain / empty free list marker
pub(crate) const NIL: u32 = u32::MAX;

/// Overflow items per slab
pub(crate) const EXTENSION_ITEM_COUNT: usize = 10;

/// Buckets covered by one slab
pub(crate) const BUCKETS_PER_SLAB: usize = 128;

pub(crate) struct ExtensionItem {
    key: AtomicU64,
    value: AtomicU64,
    next: AtomicU32,
}

impl ExtensionItem {
    fn new(next: u32) -> Self {
        Self {
            key: AtomicU64::new(0),
            value: AtomicU64::new(0),
            next: AtomicU32::new(next),
        }
    }

    #[inline(always)]
    pub(crate) fn key(&self) -> u64 {
        self.key.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn next(&self, order: Ordering) -> u32 {
        self.next.load(order)
    }

    #[inline(always)]
    pub(crate) fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn fill(&self, key: u64, value: u64, next: u32) {
        self.key.store(key, Ordering::Relaxed);
        self.value.store(value, Ordering::Relaxed);
        self.next.store(next, Ordering::Relaxed);
    }
}

/// Free list over one slab's items.
///
/// Callers already hold the lock of the bucket they allocate for, but 128 buckets share a
/// slab, so the free list carries its own short spin flag.
pub(crate) struct Slab {
    lock: AtomicBool,
    free: AtomicU32,
}

impl Slab {
    fn new(first: u32) -> Self {
        Self {
            lock: AtomicBool::new(false),
            free: AtomicU32::new(first),
        }
    }

    #[inline(always)]
    pub(crate) fn is_exhausted(&self) -> bool {
        self.free.load(Ordering::Relaxed) == NIL
    }

    #[inline(always)]
    fn acquire<B: Backoff>(&self) {
        let mut backoff = B::default();
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.backoff();
        }
    }

    #[inline(always)]
    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Pop a free item, or `None` if the slab is exhausted.
    pub(crate) fn allocate<B: Backoff>(&self, items: &[ExtensionItem]) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.acquire::<B>();
        let head = self.free.load(Ordering::Relaxed);
        let result = if head == NIL {
            None
        } else {
            let next = items[head as usize].next(Ordering::Relaxed);
            self.free.store(next, Ordering::Relaxed);
            Some(head)
        };
        self.release();
        result
    }

    /// Push `item` back; it must have been allocated from this slab and be unlinked.
    pub(crate) fn free<B: Backoff>(&self, items: &[ExtensionItem], item: u32) {
        self.acquire::<B>();
        let head = self.free.load(Ordering::Relaxed);
        items[item as usize].set_next(head);
        self.free.store(item, Ordering::Relaxed);
        self.release();
    }
}

/// Build `slab_count` slabs and their items with every item on its slab's free list.
pub(crate) fn build_slabs(slab_count: usize) -> (Box<[ExtensionItem]>, Box<[Slab]>) {
    let total = slab_count * EXTENSION_ITEM_COUNT;
    let items = (0..total)
        .map(|i| {
            let last_in_slab = (i + 1) % EXTENSION_ITEM_COUNT == 0;
            ExtensionItem::new(if last_in_slab { NIL } else { (i + 1) as u32 })
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let slabs = (0..slab_count)
        .map(|s| Slab::new((s * EXTENSION_ITEM_COUNT) as u32))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    (items, slabs)
}

/// Number of slabs for a generation of `bucket_count` buckets.
#[inline(always)]
pub(crate) fn slab_count(bucket_count: usize) -> usize {
    bucket_count.div_ceil(BUCKETS_PER_SLAB).max(1)
}

/// Slab owning `item`.
#[inline(always)]
pub(crate) fn slab_of_item(item: u32) -> usize {
    item as usize / EXTENSION_ITEM_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::NoBackoff;

    #[test]
    fn slab_hands_out_each_item_once() {
        let (items, slabs) = build_slabs(2);
        let mut got = Vec::new();
        while let Some(i) = slabs[1].allocate::<NoBackoff>(&items) {
            got.push(i);
        }
        got.sort_unstable();
        assert_eq!(got, (10..20).collect::<Vec<u32>>());
        assert!(slabs[1].is_exhausted());
        assert!(!slabs[0].is_exhausted());

        slabs[1].free::<NoBackoff>(&items, 13);
        assert_eq!(slabs[1].allocate::<NoBackoff>(&items), Some(13));
        assert_eq!(slabs[1].allocate::<NoBackoff>(&items), None);
    }

    #[test]
    fn slab_counts() {
        assert_eq!(slab_count(1), 1);
        assert_eq!(slab_count(128), 1);
        assert_eq!(slab_count(256), 2);
        assert_eq!(slab_count(1024), 8);
        assert_eq!(slab_of_item(9), 0);
        assert_eq!(slab_of_item(10), 1);
    }
}
