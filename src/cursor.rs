//! Traversal: the locking [`Cursor`] and the copying [`Iter`].

use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Guard};

use crate::backoff::Backoff;
use crate::block::{Block, Position};
use crate::bucket::{Bucket, BucketState};
use crate::extension::NIL;
use crate::word::{Value, Word};
use crate::VyukovMap;

// ================================================================================================
// CURSOR
// ================================================================================================

/// A position in the map that owns the lock of the bucket it points into.
///
/// Created by [`VyukovMap::begin`] or [`VyukovMap::end`]. The whole traversal stays on the
/// generation that was current when it began; entries inserted or removed concurrently may
/// or may not be seen, entries present throughout are seen exactly once.
///
/// While positioned, other threads writing to the same bucket (and any growth) wait for the
/// cursor to move on. The owning thread must not mutate the map through other methods
/// while the cursor is positioned.
pub struct Cursor<'m, K, V: Value, S, B> {
    map: &'m VyukovMap<K, V, S, B>,
    at: Option<Positioned>,
}

struct Positioned {
    guard: Guard,
    block: *const Block,
    index: usize,
    /// State read when the bucket was locked, plus any in-place changes since.
    state: BucketState,
    pos: Position,
}

impl Positioned {
    #[inline(always)]
    fn block(&self) -> &Block {
        // SAFETY: the generation is kept alive by `guard` and the map outlives the cursor.
        unsafe { &*self.block }
    }

    #[inline(always)]
    fn bucket(&self) -> &Bucket {
        self.block().bucket(self.index)
    }

    fn entry(&self) -> (u64, u64) {
        match self.pos {
            Position::Inline(slot) => (self.bucket().key(slot), self.bucket().value(slot)),
            Position::Chain { item, .. } => {
                let item = self.block().item(item);
                (item.key(), item.value())
            }
        }
    }

    /// Release the current bucket and lock the next one. Returns false past the last bucket.
    fn next_bucket<B: Backoff>(&mut self) -> bool {
        self.bucket().unlock(self.state);
        self.index += 1;
        if self.index == self.block().bucket_count() {
            return false;
        }
        self.state = self.bucket().lock::<B>();
        self.pos = Position::Inline(0);
        true
    }
}

impl<'m, K, V, S, B> Cursor<'m, K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher,
    B: Backoff,
{
    pub(crate) fn begin(map: &'m VyukovMap<K, V, S, B>) -> Self {
        let guard = epoch::pin();
        let block: *const Block = map.current(&guard);
        // SAFETY: just loaded under `guard`.
        let state = unsafe { &*block }.bucket(0).lock::<B>();
        let mut cursor = Self {
            map,
            at: Some(Positioned {
                guard,
                block,
                index: 0,
                state,
                pos: Position::Inline(0),
            }),
        };
        cursor.settle();
        cursor
    }

    pub(crate) fn end(map: &'m VyukovMap<K, V, S, B>) -> Self {
        Self { map, at: None }
    }

    /// Move forward until the position names a live entry, or become `end`.
    fn settle(&mut self) {
        while let Some(p) = self.at.as_mut() {
            match p.pos {
                Position::Inline(slot) if slot < p.state.item_count() => return,
                Position::Inline(_) => {
                    let head = p.bucket().head(Ordering::Relaxed);
                    p.pos = Position::Chain { prev: NIL, item: head };
                }
                Position::Chain { item, .. } if item != NIL => return,
                Position::Chain { .. } => {
                    if !p.next_bucket::<B>() {
                        self.at = None;
                    }
                }
            }
        }
    }

    /// Step to the next entry. Does nothing at `end`.
    pub fn advance(&mut self) {
        if let Some(p) = self.at.as_mut() {
            p.pos = match p.pos {
                Position::Inline(slot) => Position::Inline(slot + 1),
                Position::Chain { item, .. } => Position::Chain {
                    prev: item,
                    item: p.block().item(item).next(Ordering::Relaxed),
                },
            };
        }
        self.settle();
    }

    /// True once the traversal has moved past the last entry.
    pub fn is_end(&self) -> bool {
        self.at.is_none()
    }

    /// Key of the current entry.
    pub fn key(&self) -> Option<K> {
        self.at.as_ref().map(|p| K::from_bits(p.entry().0))
    }

    /// Value of the current entry.
    pub fn value(&self) -> Option<V::Read<'_>> {
        self.at.as_ref().map(|p| {
            // SAFETY: the entry is live in a bucket this cursor holds locked, or in a
            // migrated snapshot kept alive by the cursor's guard.
            unsafe { V::read(p.entry().1, &p.guard) }
        })
    }

    /// Remove the current entry and move to the next one. Returns false at `end`.
    pub fn erase(&mut self) -> bool {
        let Some(p) = self.at.as_mut() else {
            return false;
        };

        if p.state.is_moved() {
            // Migrated buckets are frozen; the key now lives in a newer generation.
            let key = K::from_bits(p.entry().0);
            p.bucket().unlock(p.state);
            self.map.erase(&key);
            p.state = p.bucket().lock::<B>();
            self.advance();
            return true;
        }

        let resume = match p.pos {
            Position::Inline(slot) => Position::Inline(slot),
            Position::Chain { prev, item } => Position::Chain {
                prev,
                item: p.block().item(item).next(Ordering::Relaxed),
            },
        };
        let (next, raw) = p.block().remove_locked::<B>(p.bucket(), p.state, p.pos);
        let next = next.bumped();
        p.bucket().store_locked(next);
        p.state = next;
        p.pos = resume;
        self.map.len.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: unlinked while the bucket is locked; readers pinned from now on cannot
        // reach it.
        unsafe { V::retire(raw, &p.guard) };

        self.settle();
        true
    }
}

impl<K, V: Value, S, B> PartialEq for Cursor<'_, K, V, S, B> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.at, &other.at) {
            (None, None) => true,
            (Some(a), Some(b)) => a.block == b.block && a.index == b.index && a.pos == b.pos,
            _ => false,
        }
    }
}

impl<K, V: Value, S, B> Cursor<'_, K, V, S, B> {
    /// Release the held bucket and the guard, turning this cursor into `end`.
    pub fn reset(&mut self) {
        if let Some(p) = self.at.take() {
            p.bucket().unlock(p.state);
        }
    }
}

impl<K, V: Value, S, B> Drop for Cursor<'_, K, V, S, B> {
    fn drop(&mut self) {
        self.reset();
    }
}

// ================================================================================================
// ITERATOR
// ================================================================================================

/// Iterator over `(key, value)` pairs, created by [`VyukovMap::iter`].
///
/// Copies one bucket at a time under its lock and releases it before yielding, so no lock
/// is held between calls to `next`.
pub struct Iter<'m, K, V: Value, S, B> {
    /// Pins the generation behind `block`.
    _guard: Guard,
    block: *const Block,
    bucket_index: usize,
    entries_collected: Vec<(K, V)>,
    entries_index: usize,
    _map: PhantomData<(&'m VyukovMap<K, V, S, B>, fn() -> B)>,
}

impl<'m, K, V, S, B> Iter<'m, K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Word,
    S: BuildHasher,
    B: Backoff,
{
    pub(crate) fn new(map: &'m VyukovMap<K, V, S, B>) -> Self {
        let guard = epoch::pin();
        let block: *const Block = map.current(&guard);
        Self {
            _guard: guard,
            block,
            bucket_index: 0,
            entries_collected: Vec::new(),
            entries_index: 0,
            _map: PhantomData,
        }
    }

    fn collect_next_bucket(&mut self) -> bool {
        // SAFETY: the generation is kept alive by `_guard` and the map outlives the iterator.
        let block = unsafe { &*self.block };
        self.entries_collected.clear();
        self.entries_index = 0;

        while self.bucket_index < block.bucket_count() {
            let bucket = block.bucket(self.bucket_index);
            let state = bucket.lock::<B>();
            let entries = &mut self.entries_collected;
            block.for_each_entry(bucket, state, |k, v| {
                entries.push((K::from_bits(k), V::from_bits(v)));
            });
            bucket.unlock(state);
            self.bucket_index += 1;

            if !self.entries_collected.is_empty() {
                return true;
            }
        }
        false
    }
}

impl<K, V, S, B> Iterator for Iter<'_, K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Word,
    S: BuildHasher,
    B: Backoff,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(&pair) = self.entries_collected.get(self.entries_index) {
                self.entries_index += 1;
                return Some(pair);
            }
            if !self.collect_next_bucket() {
                return None;
            }
        }
    }
}
