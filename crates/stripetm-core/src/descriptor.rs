//! The per-thread transaction descriptor, the shared slot it publishes,
//! and the process-wide registry of slots.
//!
//! The descriptor proper is thread-owned and holds the hot private state
//! (logs, times, mode). The slot carries exactly the fields other threads
//! read: the status word for cohort scans, the in-tx flag for the switch
//! controller, the reclamation epoch, the commit order (reset by the
//! switcher during quiescence), the queue turn word, plus the statistics
//! counters, which survive slot recycling.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use stripetm_error::StripetmError;

use crate::bytelock::MAX_THREADS;
use crate::cache_aligned::CacheAligned;
use crate::checkpoint::Checkpoint;
use crate::epoch::TxAlloc;
use crate::filter::BloomFilter;
use crate::logs::{StripeList, UndoLog, ValueLog, WriteSet};
use crate::orec::owner_word;
use crate::stats::ToxicHistogram;
use crate::sync::Backoff;

/// Barrier dispatch tag: which variant of the installed algorithm's
/// read/write/commit runs for this thread right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// No write yet; read-only fast paths.
    #[default]
    ReadOnly,
    /// At least one write buffered or performed.
    ReadWrite,
    /// In-place phase: the thread has proven no conflicting transaction
    /// can exist.
    Turbo,
}

/// Published transaction status, read by cohort scans and the switcher.
pub mod status {
    pub const COMMITTED: u32 = 0;
    pub const STARTED: u32 = 1;
    pub const CPENDING: u32 = 2;
    pub const DONE: u32 = 3;
    pub const NOT_DONE: u32 = 4;
}

/// Queue turn values (commit FIFO).
pub mod turn {
    pub const NOT_DONE: u32 = 0;
    pub const DONE: u32 = 1;
}

/// Sentinel: no commit order held.
pub const NO_ORDER: i64 = -1;

/// The cross-thread-visible half of a descriptor.
pub struct Slot {
    /// Cohort status word. Written with release by the owner.
    pub status: AtomicU32,
    /// Set while the owner is inside an outer transaction.
    pub in_tx: AtomicBool,
    /// Reclamation parity epoch: odd while inside a transaction.
    pub epoch: AtomicU64,
    /// Commit order for ordered algorithms; NO_ORDER when none. The owner
    /// reads/writes it; the switcher resets it during quiescence.
    pub order: AtomicI64,
    /// Turn word for queue-ordered cohort commit.
    pub turn: AtomicU32,
    /// Whether a live thread currently occupies this slot.
    pub alive: AtomicBool,
    // Statistics; Relaxed increments, retained across recycling.
    pub commits_ro: AtomicU64,
    pub commits_rw: AtomicU64,
    pub aborts: AtomicU64,
    pub restarts: AtomicU64,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            status: AtomicU32::new(status::COMMITTED),
            in_tx: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            order: AtomicI64::new(NO_ORDER),
            turn: AtomicU32::new(turn::NOT_DONE),
            alive: AtomicBool::new(false),
            commits_ro: AtomicU64::new(0),
            commits_rw: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }
}

impl Slot {
    /// Current status word.
    #[inline]
    #[must_use]
    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    /// Publish a status word.
    #[inline]
    pub fn set_status(&self, s: u32) {
        self.status.store(s, Ordering::Release);
    }

    /// Current commit order, NO_ORDER when none.
    #[inline]
    #[must_use]
    pub fn order(&self) -> i64 {
        self.order.load(Ordering::Acquire)
    }

    /// Publish a commit order.
    #[inline]
    pub fn set_order(&self, o: i64) {
        self.order.store(o, Ordering::Release);
    }
}

/// Process-wide registry of descriptor slots.
///
/// Slots are claimed at `thread_init` and recycled at thread exit so
/// short-lived threads do not exhaust the table. The high-water count
/// bounds every registry scan; released slots keep a quiescent shape
/// (COMMITTED, idle epoch) so scans stay correct.
pub struct Registry {
    slots: Box<[CacheAligned<Slot>]>,
    high_water: AtomicU32,
    free: Mutex<Vec<u32>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Build the fixed slot table.
    #[must_use]
    pub fn new() -> Self {
        let slots: Box<[CacheAligned<Slot>]> =
            (0..MAX_THREADS).map(|_| CacheAligned::new(Slot::default())).collect();
        Self {
            slots,
            high_water: AtomicU32::new(0),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Claim a slot for the calling thread.
    pub fn claim(&self) -> Result<u32, StripetmError> {
        let id = if let Some(id) = self.free.lock().pop() {
            id
        } else {
            let id = self.high_water.fetch_add(1, Ordering::AcqRel);
            if id as usize >= MAX_THREADS {
                self.high_water.fetch_sub(1, Ordering::AcqRel);
                return Err(StripetmError::ThreadSlotsExhausted {
                    max_threads: MAX_THREADS,
                });
            }
            id
        };
        let s = self.slot(id);
        s.set_status(status::COMMITTED);
        s.in_tx.store(false, Ordering::Release);
        s.set_order(NO_ORDER);
        s.turn.store(turn::NOT_DONE, Ordering::Release);
        s.alive.store(true, Ordering::Release);
        tracing::debug!(target: "stripetm.registry", slot = id, "slot claimed");
        Ok(id)
    }

    /// Return a slot at thread exit. The slot is left in the quiescent
    /// shape every scan expects of an idle thread.
    pub fn release(&self, id: u32) {
        let s = self.slot(id);
        s.set_status(status::COMMITTED);
        s.in_tx.store(false, Ordering::Release);
        s.set_order(NO_ORDER);
        // Park the epoch on an even value so reclamation never waits on a
        // dead thread.
        let e = s.epoch.load(Ordering::Acquire);
        if e % 2 == 1 {
            s.epoch.store(e + 1, Ordering::Release);
        }
        s.alive.store(false, Ordering::Release);
        self.free.lock().push(id);
        tracing::debug!(target: "stripetm.registry", slot = id, "slot released");
    }

    /// The slot at index `id`.
    #[inline]
    #[must_use]
    pub fn slot(&self, id: u32) -> &Slot {
        &self.slots[id as usize]
    }

    /// One past the largest slot index ever claimed; bounds every scan.
    #[inline]
    #[must_use]
    pub fn high_water(&self) -> u32 {
        self.high_water.load(Ordering::Acquire).min(MAX_THREADS as u32)
    }

    /// Iterate every slot that has ever been claimed.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Slot)> {
        (0..self.high_water()).map(move |i| (i, self.slot(i)))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("high_water", &self.high_water())
            .finish_non_exhaustive()
    }
}

/// The thread-owned transaction descriptor.
#[derive(Debug)]
pub struct Descriptor {
    /// Registry slot index.
    pub slot_id: u32,
    /// Owner id (slot + 1); never zero.
    pub id: u32,
    /// Orec owner encoding for this thread.
    pub my_lock: u64,

    pub nesting_depth: u32,
    pub mode: Mode,
    pub checkpoint: Checkpoint,

    pub start_time: u64,
    pub end_time: u64,
    pub ts_cache: u64,
    /// Dispatch generation captured at begin.
    pub gen_cache: u64,
    /// Algorithm index captured at begin; commits/rollbacks use this even
    /// if a switch is already pending.
    pub alg_cache: usize,

    pub r_orecs: StripeList,
    pub locks: StripeList,
    pub r_bytelocks: StripeList,
    pub w_bytelocks: StripeList,
    pub r_bitlocks: StripeList,
    pub w_bitlocks: StripeList,
    pub vlist: ValueLog,
    pub writes: WriteSet,
    pub undo_log: UndoLog,
    pub rf: BloomFilter,
    pub wf: BloomFilter,

    pub alloc: TxAlloc,
    pub backoff: Backoff,
    pub consec_aborts: u32,
    pub abort_hist: ToxicHistogram,

    // Per-cohort tallies feeding the early-seal thresholds.
    pub cohort_reads: u32,
    pub cohort_writes: u32,
    pub cohort_aborts: u32,
}

impl Descriptor {
    /// Build the descriptor for a freshly claimed slot.
    #[must_use]
    pub fn new(slot_id: u32) -> Self {
        let id = slot_id + 1;
        Self {
            slot_id,
            id,
            my_lock: owner_word(id),
            nesting_depth: 0,
            mode: Mode::ReadOnly,
            checkpoint: Checkpoint::default(),
            start_time: 0,
            end_time: 0,
            ts_cache: 0,
            gen_cache: 0,
            alg_cache: 0,
            r_orecs: StripeList::with_capacity(64),
            locks: StripeList::with_capacity(64),
            r_bytelocks: StripeList::with_capacity(64),
            w_bytelocks: StripeList::with_capacity(64),
            r_bitlocks: StripeList::with_capacity(64),
            w_bitlocks: StripeList::with_capacity(64),
            vlist: ValueLog::default(),
            writes: WriteSet::default(),
            undo_log: UndoLog::default(),
            rf: BloomFilter::default(),
            wf: BloomFilter::default(),
            alloc: TxAlloc::default(),
            backoff: Backoff::new(slot_id),
            consec_aborts: 0,
            abort_hist: ToxicHistogram::default(),
            cohort_reads: 0,
            cohort_writes: 0,
            cohort_aborts: 0,
        }
    }

    /// Clear every per-transaction log. Called from commit and rollback.
    pub fn reset_lists(&mut self) {
        self.r_orecs.clear();
        self.locks.clear();
        self.r_bytelocks.clear();
        self.w_bytelocks.clear();
        self.r_bitlocks.clear();
        self.w_bitlocks.clear();
        self.vlist.reset();
        self.writes.reset();
        self.undo_log.reset();
        self.rf.clear();
        self.wf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn claim_release_recycles() {
        let r = Registry::new();
        let a = r.claim().unwrap();
        let b = r.claim().unwrap();
        assert_ne!(a, b);
        r.release(a);
        let c = r.claim().unwrap();
        assert_eq!(c, a);
        assert_eq!(r.high_water(), 2);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let r = Registry::new();
        let mut claimed = Vec::new();
        for _ in 0..MAX_THREADS {
            claimed.push(r.claim().unwrap());
        }
        assert!(matches!(
            r.claim(),
            Err(StripetmError::ThreadSlotsExhausted { .. })
        ));
        for id in claimed {
            r.release(id);
        }
        assert!(r.claim().is_ok());
    }

    #[test]
    fn released_slot_is_quiescent() {
        let r = Registry::new();
        let id = r.claim().unwrap();
        let s = r.slot(id);
        s.set_status(status::STARTED);
        s.epoch.store(7, Ordering::Release);
        s.set_order(12);
        r.release(id);
        assert_eq!(s.status(), status::COMMITTED);
        assert_eq!(s.order(), NO_ORDER);
        assert_eq!(s.epoch.load(Ordering::Acquire) % 2, 0);
        assert!(!s.alive.load(Ordering::Acquire));
    }

    #[test]
    fn concurrent_claims_are_distinct() {
        let r = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&r);
                thread::spawn(move || r.claim().unwrap())
            })
            .collect();
        let mut ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn descriptor_owner_word_is_marked() {
        let d = Descriptor::new(4);
        assert_eq!(d.id, 5);
        assert!(crate::orec::is_owned(d.my_lock));
        assert_eq!(crate::orec::owner_of(d.my_lock), 5);
    }
}
