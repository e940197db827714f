//! Contention backoff strategies used by every spin loop in the map.

use std::thread;

/// Pure CPU hints before any yield
const SPIN_BEFORE_YIELD: u32 = 128;

/// A retry primitive invoked after each failed attempt to take a bucket lock, each
/// invalidated optimistic read and each poll of the growth flag.
///
/// A fresh value is created (via `Default`) for every retry loop, so implementations may
/// keep per-loop state. Implementations must eventually yield or delay and must never
/// block indefinitely on their own.
pub trait Backoff: Default {
    fn backoff(&mut self);
}

/// Spin-loop hint only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    #[inline(always)]
    fn backoff(&mut self) {
        std::hint::spin_loop();
    }
}

/// Doubling spin budget, then `yield_now` once the budget is spent.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExponentialBackoff {
    spins: u32,
}

impl ExponentialBackoff {
    #[inline(always)]
    fn try_spin(&mut self) -> bool {
        if self.spins < SPIN_BEFORE_YIELD {
            self.spins += self.spins + 1;
            for _ in 0..self.spins {
                std::hint::spin_loop();
            }
            true
        } else {
            false
        }
    }
}

impl Backoff for ExponentialBackoff {
    #[inline(always)]
    fn backoff(&mut self) {
        if !self.try_spin() {
            self.spins = 0;
            thread::yield_now();
        }
    }
}

impl Backoff for crossbeam_utils::Backoff {
    #[inline(always)]
    fn backoff(&mut self) {
        self.snooze();
    }
}
