//! Bytelocks: reader/writer locks where each thread announces readership in
//! its own byte.
//!
//! A bytelock is a 32-bit owner word (0 = free) plus one reader byte per
//! thread slot. The reader array dimension bounds the whole library at
//! [`MAX_THREADS`] concurrent threads. Invariants: at most one nonzero
//! owner at a time; a reader byte may be 1 only while the owner word is 0
//! or names the same thread.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use crate::cache_aligned::CacheAligned;
use crate::heap::Addr;

/// Hard bound on registered threads, fixed by the reader-byte array.
pub const MAX_THREADS: usize = 60;

/// One bytelock.
pub struct ByteLock {
    owner: AtomicU32,
    readers: [AtomicU8; MAX_THREADS],
}

impl Default for ByteLock {
    fn default() -> Self {
        Self {
            owner: AtomicU32::new(0),
            readers: std::array::from_fn(|_| AtomicU8::new(0)),
        }
    }
}

impl ByteLock {
    /// The current owner id, 0 when free.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    /// Try to take the write half, 0 → `id`.
    #[inline]
    pub fn try_own(&self, id: u32) -> bool {
        self.owner
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop the write half.
    #[inline]
    pub fn release_owner(&self) {
        self.owner.store(0, Ordering::Release);
    }

    /// Announce readership for `slot`.
    #[inline]
    pub fn set_reader(&self, slot: usize) {
        self.readers[slot].store(1, Ordering::SeqCst);
    }

    /// Withdraw readership for `slot`.
    #[inline]
    pub fn clear_reader(&self, slot: usize) {
        self.readers[slot].store(0, Ordering::Release);
    }

    /// Is `slot` currently announced as a reader?
    #[inline]
    #[must_use]
    pub fn is_reader(&self, slot: usize) -> bool {
        self.readers[slot].load(Ordering::Acquire) == 1
    }

    /// Count of reader bytes still set, excluding `except`. Writers drain
    /// on this reaching zero.
    #[must_use]
    pub fn readers_remaining(&self, except: usize) -> usize {
        self.readers
            .iter()
            .enumerate()
            .filter(|(i, r)| *i != except && r.load(Ordering::Acquire) != 0)
            .count()
    }
}

impl std::fmt::Debug for ByteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteLock")
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

/// The global bytelock table, addressed by the same stripe hash as orecs.
pub struct ByteLockTable {
    entries: Box<[CacheAligned<ByteLock>]>,
    mask: usize,
}

impl ByteLockTable {
    /// Build a table of `n_stripes` bytelocks (power of two).
    #[must_use]
    pub fn new(n_stripes: usize) -> Self {
        assert!(n_stripes.is_power_of_two(), "stripe count must be a power of two");
        let entries: Box<[CacheAligned<ByteLock>]> = (0..n_stripes)
            .map(|_| CacheAligned::new(ByteLock::default()))
            .collect();
        Self {
            entries,
            mask: n_stripes - 1,
        }
    }

    /// Stripe index covering `addr`.
    #[inline]
    #[must_use]
    pub fn stripe_of(&self, addr: Addr) -> usize {
        addr.index() & self.mask
    }

    /// The bytelock for a stripe index.
    #[inline]
    #[must_use]
    pub fn entry(&self, stripe: usize) -> &ByteLock {
        &self.entries[stripe]
    }

    /// The bytelock covering `addr`.
    #[inline]
    #[must_use]
    pub fn entry_for(&self, addr: Addr) -> &ByteLock {
        self.entry(self.stripe_of(addr))
    }
}
