//! The process-wide shared state every algorithm operates against.
//!
//! One `StmGlobals` is built at system init and lives for the process: the
//! word arena, the metadata tables, the descriptor registry, the clock and
//! cohort counters, and the switch controller. Algorithms never own shared
//! state of their own; everything they coordinate through lives here so a
//! hot swap can hand the same planes to the next algorithm.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::bitlock::BitLockTable;
use crate::bytelock::ByteLockTable;
use crate::cache_aligned::CacheAligned;
use crate::checkpoint::{Abort, TxResult};
use crate::descriptor::{NO_ORDER, Registry, status, turn};
use crate::filter::AtomicBloomFilter;
use crate::heap::SharedHeap;
use crate::orec::OrecTable;
use crate::sync::spin_hint;

/// Priority-request bit of the fastlane counter.
pub const FL_PRIORITY_BIT: u64 = 1 << 63;

/// Sizing knobs fixed at init.
#[derive(Debug, Clone, Copy)]
pub struct GlobalsConfig {
    /// Arena capacity in words.
    pub heap_words: usize,
    /// Stripe count for the orec/bytelock/bitlock tables (power of two).
    pub n_stripes: usize,
}

impl Default for GlobalsConfig {
    fn default() -> Self {
        Self {
            heap_words: 1 << 20,
            n_stripes: 1 << 20,
        }
    }
}

/// Early-seal thresholds (−1 disables a dimension).
#[derive(Debug)]
pub struct SealThresholds {
    pub reads: AtomicI64,
    pub writes: AtomicI64,
    pub aborts: AtomicI64,
}

impl Default for SealThresholds {
    fn default() -> Self {
        Self {
            reads: AtomicI64::new(-1),
            writes: AtomicI64::new(-1),
            aborts: AtomicI64::new(-1),
        }
    }
}

/// Serializes algorithm installation against outer begins.
#[derive(Debug, Default)]
pub struct SwitchController {
    gate: AtomicBool,
    generation: AtomicU64,
    current: AtomicUsize,
}

impl SwitchController {
    /// Is a switch (or thread registration) holding the begin gate?
    #[inline]
    #[must_use]
    pub fn blocked(&self) -> bool {
        self.gate.load(Ordering::SeqCst)
    }

    /// Take the gate; only one holder at a time.
    pub fn lock_gate(&self) {
        while self
            .gate
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            spin_hint();
        }
    }

    /// Drop the gate.
    pub fn unlock_gate(&self) {
        self.gate.store(false, Ordering::SeqCst);
    }

    /// Index of the installed algorithm.
    #[inline]
    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Installation count; bumps once per completed switch.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Publish a new installation. Caller holds the gate and has proven
    /// quiescence.
    pub fn publish(&self, alg_index: usize) {
        self.current.store(alg_index, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// All shared planes.
pub struct StmGlobals {
    pub heap: SharedHeap,
    pub orecs: OrecTable,
    pub bytelocks: ByteLockTable,
    pub bitlocks: BitLockTable,
    pub global_filter: AtomicBloomFilter,
    pub registry: Registry,
    pub switch: SwitchController,
    pub seal_thresholds: SealThresholds,

    /// The global version clock; also the NOrec sequence lock and the
    /// order source for ordered algorithms.
    pub timestamp: CacheAligned<AtomicU64>,
    /// Backup of the clock for algorithms that repurpose it.
    pub timestamp_max: CacheAligned<AtomicU64>,
    /// Order of the most recently finished committer.
    pub last_complete: CacheAligned<AtomicU64>,
    /// First order of the current cohort.
    pub last_order: CacheAligned<AtomicU64>,

    // Cohort gate counters.
    pub started: CacheAligned<AtomicU64>,
    pub cpending: CacheAligned<AtomicU64>,
    pub committed: CacheAligned<AtomicU64>,
    /// Cohort gatekeeper flag (scan-based variants).
    pub gatekeeper: CacheAligned<AtomicU32>,
    /// Writer-in-place flag; at most one per cohort.
    pub inplace: CacheAligned<AtomicU32>,
    /// Early-seal flag.
    pub sealed: CacheAligned<AtomicU32>,
    /// Head of the commit FIFO: slot id + 1, 0 when empty.
    pub commit_queue: CacheAligned<AtomicU32>,

    // Fastlane plane.
    /// Version counter; low bit = master active, high bit = priority
    /// request.
    pub fl_counter: CacheAligned<AtomicU64>,
    pub fl_master: CacheAligned<AtomicU32>,
    pub fl_helper: CacheAligned<AtomicU32>,
}

impl StmGlobals {
    /// Allocate every shared plane.
    #[must_use]
    pub fn new(config: GlobalsConfig) -> Self {
        Self {
            heap: SharedHeap::new(config.heap_words),
            orecs: OrecTable::new(config.n_stripes),
            bytelocks: ByteLockTable::new(config.n_stripes),
            bitlocks: BitLockTable::new(config.n_stripes),
            global_filter: AtomicBloomFilter::default(),
            registry: Registry::new(),
            switch: SwitchController::default(),
            seal_thresholds: SealThresholds::default(),
            timestamp: CacheAligned::new(AtomicU64::new(0)),
            timestamp_max: CacheAligned::new(AtomicU64::new(0)),
            last_complete: CacheAligned::new(AtomicU64::new(0)),
            last_order: CacheAligned::new(AtomicU64::new(0)),
            started: CacheAligned::new(AtomicU64::new(0)),
            cpending: CacheAligned::new(AtomicU64::new(0)),
            committed: CacheAligned::new(AtomicU64::new(0)),
            gatekeeper: CacheAligned::new(AtomicU32::new(0)),
            inplace: CacheAligned::new(AtomicU32::new(0)),
            sealed: CacheAligned::new(AtomicU32::new(0)),
            commit_queue: CacheAligned::new(AtomicU32::new(0)),
            fl_counter: CacheAligned::new(AtomicU64::new(0)),
            fl_master: CacheAligned::new(AtomicU32::new(0)),
            fl_helper: CacheAligned::new(AtomicU32::new(0)),
        }
    }

    /// Current clock value.
    #[inline]
    #[must_use]
    pub fn now(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }

    /// Fetch-and-add on the clock; the full barrier lazy algorithms rely
    /// on. Returns the incremented value.
    #[inline]
    pub fn advance_clock(&self) -> u64 {
        1 + self.timestamp.fetch_add(1, Ordering::SeqCst)
    }

    /// Spin until `cond` holds, aborting if a switch raises the begin
    /// gate. Used by every ordered/cohort wait loop whose progress could
    /// depend on a thread the gate is holding back.
    pub fn wait_or_swap(&self, mut cond: impl FnMut() -> bool) -> TxResult<()> {
        while !cond() {
            if self.switch.blocked() {
                return Err(Abort::Swap);
            }
            spin_hint();
        }
        Ok(())
    }

    /// Raise the clock over every value that may have been published into
    /// an orec: the backed-up clock, the completion counter, and the
    /// fastlane counter. Every on-switch hook calls this first so no stale
    /// orec version can exceed a fresh start time under the incoming
    /// algorithm.
    pub fn raise_clock_over_marks(&self) -> u64 {
        let mut hi = self.timestamp.load(Ordering::SeqCst);
        hi = hi.max(self.timestamp_max.load(Ordering::SeqCst));
        hi = hi.max(self.last_complete.load(Ordering::SeqCst));
        hi = hi.max(self.fl_counter.load(Ordering::SeqCst) & !FL_PRIORITY_BIT);
        self.timestamp.store(hi, Ordering::SeqCst);
        hi
    }

    /// Reset every per-slot field an outgoing algorithm may have left
    /// behind, plus the cohort planes. Runs under the begin gate with all
    /// transactions drained.
    pub fn reset_slots_and_cohort_planes(&self) {
        for (_, slot) in self.registry.iter() {
            slot.set_status(status::COMMITTED);
            slot.set_order(NO_ORDER);
            slot.turn.store(turn::NOT_DONE, Ordering::SeqCst);
        }
        self.started.store(0, Ordering::SeqCst);
        self.cpending.store(0, Ordering::SeqCst);
        self.committed.store(0, Ordering::SeqCst);
        self.gatekeeper.store(0, Ordering::SeqCst);
        self.inplace.store(0, Ordering::SeqCst);
        self.sealed.store(0, Ordering::SeqCst);
        self.commit_queue.store(0, Ordering::SeqCst);
        self.global_filter.clear();
    }
}

impl std::fmt::Debug for StmGlobals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StmGlobals")
            .field("timestamp", &self.timestamp.load(Ordering::Relaxed))
            .field("last_complete", &self.last_complete.load(Ordering::Relaxed))
            .field("generation", &self.switch.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> StmGlobals {
        StmGlobals::new(GlobalsConfig {
            heap_words: 256,
            n_stripes: 64,
        })
    }

    #[test]
    fn clock_advances_and_raises_over_marks() {
        let g = small();
        assert_eq!(g.advance_clock(), 1);
        assert_eq!(g.now(), 1);
        g.last_complete.store(10, Ordering::SeqCst);
        g.fl_counter.store(FL_PRIORITY_BIT | 6, Ordering::SeqCst);
        assert_eq!(g.raise_clock_over_marks(), 10);
        assert_eq!(g.now(), 10);
    }

    #[test]
    fn wait_or_swap_aborts_under_gate() {
        let g = small();
        g.switch.lock_gate();
        assert_eq!(g.wait_or_swap(|| false), Err(Abort::Swap));
        g.switch.unlock_gate();
        assert_eq!(g.wait_or_swap(|| true), Ok(()));
    }

    #[test]
    fn switch_reset_clears_cohort_planes() {
        let g = small();
        let id = g.registry.claim().unwrap();
        g.registry.slot(id).set_status(status::CPENDING);
        g.registry.slot(id).set_order(5);
        g.gatekeeper.store(1, Ordering::SeqCst);
        g.sealed.store(1, Ordering::SeqCst);
        g.started.store(3, Ordering::SeqCst);
        g.reset_slots_and_cohort_planes();
        assert_eq!(g.registry.slot(id).status(), status::COMMITTED);
        assert_eq!(g.registry.slot(id).order(), NO_ORDER);
        assert_eq!(g.gatekeeper.load(Ordering::SeqCst), 0);
        assert_eq!(g.sealed.load(Ordering::SeqCst), 0);
        assert_eq!(g.started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn publish_bumps_generation() {
        let g = small();
        let gen = g.switch.generation();
        g.switch.lock_gate();
        g.switch.publish(3);
        g.switch.unlock_gate();
        assert_eq!(g.switch.current(), 3);
        assert_eq!(g.switch.generation(), gen + 1);
    }
}
