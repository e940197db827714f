//! Payload types the map can store.
//!
//! Every key and value lives in a bucket as a single `u64` so that optimistic readers
//! only ever perform atomic loads. [`Word`] covers plain 4- and 8-byte copy types;
//! [`Managed`] stores a heap pointer whose lifetime is handed to the epoch collector.

use std::fmt;
use std::mem;

use crossbeam_epoch::{Guard, Shared};

// ================================================================================================
// WORD
// ================================================================================================

/// A trivially copyable 4- or 8-byte type that round-trips through a `u64`.
///
/// # Safety
///
/// `from_bits(into_bits(x))` must reproduce `x`, and equal bit patterns must mean equal
/// keys. Types of any other width are rejected when a map over them is instantiated.
pub unsafe trait Word: Copy + Send + Sync + 'static {
    /// Evaluated when a map type is monomorphized; fails the build for unsupported widths.
    const ASSERT_WIDTH: () = assert!(
        mem::size_of::<Self>() == 4 || mem::size_of::<Self>() == 8,
        "map payloads must be 4 or 8 bytes wide"
    );

    fn into_bits(self) -> u64;

    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_word {
    ($($ty:ty => |$v:ident| $into:expr, |$b:ident| $from:expr;)*) => {
        $(
            unsafe impl Word for $ty {
                #[inline(always)]
                fn into_bits(self) -> u64 {
                    let $v = self;
                    $into
                }

                #[inline(always)]
                fn from_bits($b: u64) -> Self {
                    $from
                }
            }
        )*
    };
}

impl_word! {
    u32 => |v| v as u64, |b| b as u32;
    i32 => |v| v as u32 as u64, |b| b as u32 as i32;
    u64 => |v| v, |b| b;
    i64 => |v| v as u64, |b| b as i64;
    usize => |v| v as u64, |b| b as usize;
    isize => |v| v as usize as u64, |b| b as usize as isize;
    f32 => |v| v.to_bits() as u64, |b| f32::from_bits(b as u32);
    f64 => |v| v.to_bits(), |b| f64::from_bits(b);
}

unsafe impl Word for char {
    #[inline(always)]
    fn into_bits(self) -> u64 {
        self as u32 as u64
    }

    #[inline(always)]
    fn from_bits(bits: u64) -> Self {
        // Only bits produced by `into_bits` ever reach this point.
        char::from_u32(bits as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
    }
}

// ================================================================================================
// VALUE
// ================================================================================================

/// A type that can be stored as a map value.
///
/// Implemented for every [`Word`] and for [`Managed`]. The raw `u64` is owned by the map
/// from a successful insert until it is removed, at which point it is either returned
/// (plain words) or retired through the epoch collector (managed pointers).
pub trait Value: Sized + Send + Sync + 'static {
    /// What a lookup under a guard hands back.
    type Read<'g>;

    #[doc(hidden)]
    const ASSERT_WIDTH: () = ();

    /// Give up ownership of `self` as raw bits.
    fn into_raw(self) -> u64;

    /// # Safety
    ///
    /// `raw` must come from `into_raw` and still be live for the duration of `guard`.
    unsafe fn read<'g>(raw: u64, guard: &'g Guard) -> Self::Read<'g>;

    /// Hand `raw` to the collector once no map slot refers to it anymore.
    ///
    /// # Safety
    ///
    /// `raw` must be unreachable from the current generation and retired at most once.
    unsafe fn retire(_raw: u64, _guard: &Guard) {}

    /// Drop `raw` immediately; used for values that were never published or when the
    /// map itself is dropped.
    ///
    /// # Safety
    ///
    /// No other thread may be able to observe `raw`.
    unsafe fn drop_raw(_raw: u64) {}
}

impl<W: Word> Value for W {
    type Read<'g> = W;

    const ASSERT_WIDTH: () = <W as Word>::ASSERT_WIDTH;

    #[inline(always)]
    fn into_raw(self) -> u64 {
        self.into_bits()
    }

    #[inline(always)]
    unsafe fn read<'g>(raw: u64, _guard: &'g Guard) -> W {
        W::from_bits(raw)
    }
}

// ================================================================================================
// MANAGED
// ================================================================================================

/// A heap value whose lifetime is managed by the map and the epoch collector.
///
/// Lookups return `&'g T` borrowed from the caller's guard, which stays valid even if a
/// concurrent writer removes the entry.
pub struct Managed<T>(Box<T>);

impl<T> Managed<T> {
    pub fn new(value: T) -> Self {
        Managed(Box::new(value))
    }

    pub fn into_inner(self) -> T {
        *self.0
    }
}

impl<T> From<T> for Managed<T> {
    fn from(value: T) -> Self {
        Managed::new(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Managed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Managed").field(&self.0).finish()
    }
}

impl<T: Send + Sync + 'static> Value for Managed<T> {
    type Read<'g> = &'g T;

    #[inline(always)]
    fn into_raw(self) -> u64 {
        Box::into_raw(self.0) as usize as u64
    }

    #[inline(always)]
    unsafe fn read<'g>(raw: u64, _guard: &'g Guard) -> &'g T {
        &*(raw as usize as *const T)
    }

    unsafe fn retire(raw: u64, guard: &Guard) {
        guard.defer_destroy(Shared::from(raw as usize as *const T));
    }

    unsafe fn drop_raw(raw: u64) {
        drop(Box::from_raw(raw as usize as *mut T));
    }
}
