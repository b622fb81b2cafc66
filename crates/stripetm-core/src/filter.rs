//! Flat fixed-size Bloom filters for commit-time read/write set overlap
//! checks.
//!
//! Two renditions of the same 1024-bit filter: [`BloomFilter`] is plain and
//! thread-private (a descriptor's read or write filter); [`AtomicBloomFilter`]
//! is the shared accumulation target that writers union into at commit.

use std::sync::atomic::{AtomicU64, Ordering};

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::heap::Addr;

/// Filter size in bits.
pub const FILTER_BITS: usize = 1024;

const WORDS: usize = FILTER_BITS / 64;

/// Probes per inserted address.
const PROBES: u64 = 2;

#[inline]
fn probe_bits(addr: Addr) -> impl Iterator<Item = (usize, u64)> {
    (0..PROBES).map(move |seed| {
        let h = xxh3_64_with_seed(&addr.0.to_le_bytes(), seed) as usize % FILTER_BITS;
        (h / 64, 1_u64 << (h % 64))
    })
}

/// A thread-private Bloom filter.
#[derive(Clone)]
pub struct BloomFilter {
    words: [u64; WORDS],
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self { words: [0; WORDS] }
    }
}

impl BloomFilter {
    /// Insert an address.
    #[inline]
    pub fn insert(&mut self, addr: Addr) {
        for (w, bit) in probe_bits(addr) {
            self.words[w] |= bit;
        }
    }

    /// Membership test; false positives possible, false negatives not.
    #[inline]
    #[must_use]
    pub fn maybe_contains(&self, addr: Addr) -> bool {
        probe_bits(addr).all(|(w, bit)| self.words[w] & bit != 0)
    }

    /// Union another plain filter into this one.
    pub fn union_with(&mut self, other: &BloomFilter) {
        for (mine, theirs) in self.words.iter_mut().zip(other.words.iter()) {
            *mine |= *theirs;
        }
    }

    /// True when this filter shares any bit with `other`.
    #[must_use]
    pub fn intersects(&self, other: &BloomFilter) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Clear every bit.
    pub fn clear(&mut self) {
        self.words = [0; WORDS];
    }

    /// True when no bit is set.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    fn word(&self, i: usize) -> u64 {
        self.words[i]
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ones: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        f.debug_struct("BloomFilter").field("bits_set", &ones).finish()
    }
}

/// The shared filter writers union into during a cohort.
pub struct AtomicBloomFilter {
    words: [AtomicU64; WORDS],
}

impl Default for AtomicBloomFilter {
    fn default() -> Self {
        Self {
            words: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl AtomicBloomFilter {
    /// Union a thread-private filter into the shared one.
    pub fn union_from(&self, other: &BloomFilter) {
        for (i, mine) in self.words.iter().enumerate() {
            let v = other.word(i);
            if v != 0 {
                mine.fetch_or(v, Ordering::AcqRel);
            }
        }
    }

    /// True when `other` shares any bit with the shared filter.
    #[must_use]
    pub fn intersects(&self, other: &BloomFilter) -> bool {
        self.words
            .iter()
            .enumerate()
            .any(|(i, w)| w.load(Ordering::Acquire) & other.word(i) != 0)
    }

    /// Clear every bit. Only the last committer of a cohort does this.
    pub fn clear(&self) {
        for w in &self.words {
            w.store(0, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for AtomicBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ones: u32 = self
            .words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones())
            .sum();
        f.debug_struct("AtomicBloomFilter")
            .field("bits_set", &ones)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn inserted_addresses_are_members() {
        let mut f = BloomFilter::default();
        for i in 0..100 {
            f.insert(Addr(i * 37));
        }
        for i in 0..100 {
            assert!(f.maybe_contains(Addr(i * 37)));
        }
    }

    #[test]
    fn clear_empties() {
        let mut f = BloomFilter::default();
        f.insert(Addr(1));
        assert!(!f.is_clear());
        f.clear();
        assert!(f.is_clear());
        assert!(!f.intersects(&f.clone()) || f.is_clear());
    }

    #[test]
    fn atomic_union_then_intersect() {
        let shared = AtomicBloomFilter::default();
        let mut wf = BloomFilter::default();
        wf.insert(Addr(42));
        shared.union_from(&wf);

        let mut rf = BloomFilter::default();
        rf.insert(Addr(42));
        assert!(shared.intersects(&rf));

        shared.clear();
        assert!(!shared.intersects(&rf));
    }

    proptest! {
        /// No false negatives: anything inserted intersects a filter that
        /// read the same address.
        #[test]
        fn overlap_is_always_detected(addrs in proptest::collection::vec(0u32..10_000, 1..64)) {
            let mut wf = BloomFilter::default();
            for &a in &addrs {
                wf.insert(Addr(a));
            }
            let mut rf = BloomFilter::default();
            rf.insert(Addr(addrs[0]));
            prop_assert!(wf.intersects(&rf));
        }
    }
}
