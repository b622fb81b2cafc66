//! Spin primitives, the monotonic tick, and randomized exponential backoff.
//!
//! Every wait loop in the library is either bounded by an iteration count
//! that converts to an abort (bytelocks), bounded by monotone progress of
//! another thread (ordered commit), or escapes through the switch
//! controller's swap check. These helpers keep the loop bodies uniform.

use std::sync::OnceLock;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// One polite spin iteration.
#[inline]
pub fn spin_hint() {
    std::hint::spin_loop();
}

/// A short burst of spinning, used where the original protocol wants a
/// coarser pause than a single `pause` instruction.
#[inline]
pub fn spin_briefly() {
    for _ in 0..64 {
        std::hint::spin_loop();
    }
}

/// Monotonic nanosecond timestamp relative to process start.
///
/// A single process-wide epoch keeps timestamps comparable across threads.
#[must_use]
pub fn tick_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    #[allow(clippy::cast_possible_truncation)] // clamped to u64::MAX
    {
        epoch.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64
    }
}

/// Upper bound on the backoff exponent: caps a single wait at 2^20 spins.
const BACKOFF_MAX_SHIFT: u32 = 20;

/// Lower bound on the backoff exponent.
const BACKOFF_MIN_SHIFT: u32 = 4;

/// Per-thread randomized exponential backoff.
///
/// Seeded from the descriptor's slot id so runs are reproducible per thread.
/// The wait grows with the consecutive-abort count and is drawn uniformly
/// from `[0, 2^shift)` spin iterations.
#[derive(Debug)]
pub struct Backoff {
    rng: SmallRng,
}

impl Backoff {
    /// Create a backoff source for the thread occupying `slot`.
    #[must_use]
    pub fn new(slot: u32) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(0x5157_u64 << 32 | u64::from(slot)),
        }
    }

    /// Uniform draw in `[0, bound)`; `bound` must be nonzero.
    pub fn next_below(&mut self, bound: u64) -> u64 {
        self.rng.gen_range(0..bound)
    }

    /// Spin for a randomized interval scaled by `consec_aborts`.
    pub fn pause(&mut self, consec_aborts: u32) {
        let shift = BACKOFF_MIN_SHIFT.saturating_add(consec_aborts).min(BACKOFF_MAX_SHIFT);
        let limit = self.rng.gen_range(0..(1_u64 << shift));
        for _ in 0..limit {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_monotone() {
        let a = tick_ns();
        let b = tick_ns();
        assert!(b >= a);
    }

    #[test]
    fn backoff_draws_are_bounded() {
        let mut b = Backoff::new(3);
        for _ in 0..1000 {
            assert!(b.next_below(16) < 16);
        }
        // pause() must terminate even at the cap.
        b.pause(u32::MAX);
    }

    #[test]
    fn backoff_is_deterministic_per_slot() {
        let mut a = Backoff::new(7);
        let mut b = Backoff::new(7);
        let xs: Vec<u64> = (0..8).map(|_| a.next_below(1 << 30)).collect();
        let ys: Vec<u64> = (0..8).map(|_| b.next_below(1 << 30)).collect();
        assert_eq!(xs, ys);
    }
}
