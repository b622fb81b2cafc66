//! Parity-epoch deferred reclamation for transactional allocation.
//!
//! Every slot publishes an epoch that is odd while its thread is inside a
//! transaction. Frees issued by a committed transaction are pooled; when
//! the pool fills, it is stamped with a snapshot of all live epochs and
//! joins the limbo list. A limbo group is reclaimed once a later snapshot
//! strictly dominates it, meaning every thread has either left the transaction it
//! was in when the group was stamped or is idle, so no doomed reader can
//! still observe the retired words. Frees issued by an aborted transaction
//! are discarded; its allocations go straight back to the arena, since
//! their addresses were never published.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::checkpoint::{Abort, TxResult};
use crate::descriptor::{Registry, Slot};
use crate::heap::{Addr, SharedHeap, WordRange};

/// Frees pooled before a snapshot is taken.
const PRELIMBO_POOL: usize = 32;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Global reclamation metrics singleton. Lock-free Relaxed counters:
/// readers may observe stale but never torn values.
pub static GLOBAL_EPOCH_METRICS: EpochMetrics = EpochMetrics::new();

/// Atomic counters for reclamation telemetry.
pub struct EpochMetrics {
    /// Word ranges deferred for retirement by committed transactions.
    pub retirements_deferred_total: AtomicU64,
    /// Epoch snapshots taken when a pool filled.
    pub snapshots_taken_total: AtomicU64,
    /// Limbo groups returned to the arena.
    pub groups_reclaimed_total: AtomicU64,
    /// Words returned to the arena.
    pub words_reclaimed_total: AtomicU64,
    /// Allocations unwound by aborted transactions.
    pub aborted_allocs_unwound_total: AtomicU64,
}

impl EpochMetrics {
    /// All counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            retirements_deferred_total: AtomicU64::new(0),
            snapshots_taken_total: AtomicU64::new(0),
            groups_reclaimed_total: AtomicU64::new(0),
            words_reclaimed_total: AtomicU64::new(0),
            aborted_allocs_unwound_total: AtomicU64::new(0),
        }
    }

    /// Point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> EpochMetricsSnapshot {
        EpochMetricsSnapshot {
            retirements_deferred_total: self.retirements_deferred_total.load(Ordering::Relaxed),
            snapshots_taken_total: self.snapshots_taken_total.load(Ordering::Relaxed),
            groups_reclaimed_total: self.groups_reclaimed_total.load(Ordering::Relaxed),
            words_reclaimed_total: self.words_reclaimed_total.load(Ordering::Relaxed),
            aborted_allocs_unwound_total: self.aborted_allocs_unwound_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for EpochMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of [`EpochMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EpochMetricsSnapshot {
    pub retirements_deferred_total: u64,
    pub snapshots_taken_total: u64,
    pub groups_reclaimed_total: u64,
    pub words_reclaimed_total: u64,
    pub aborted_allocs_unwound_total: u64,
}

impl std::fmt::Display for EpochMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "epoch(deferred={} snapshots={} groups={} words={} unwound={})",
            self.retirements_deferred_total,
            self.snapshots_taken_total,
            self.groups_reclaimed_total,
            self.words_reclaimed_total,
            self.aborted_allocs_unwound_total,
        )
    }
}

// ---------------------------------------------------------------------------
// Limbo list
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LimboGroup {
    /// Epoch of every slot at stamping time, indexed by slot.
    stamp: Vec<u64>,
    ranges: Vec<WordRange>,
}

/// True when every thread recorded in `older` has, by the time of `newer`,
/// either advanced past the transaction it was in or is idle.
fn strictly_dominates(newer: &[u64], older: &[u64]) -> bool {
    for (i, &old) in older.iter().enumerate() {
        let new = newer.get(i).copied().unwrap_or(old);
        if new <= old && new % 2 == 1 {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// TxAlloc
// ---------------------------------------------------------------------------

/// Per-thread transactional allocator state.
#[derive(Debug, Default)]
pub struct TxAlloc {
    /// Ranges to give back if the current transaction aborts.
    allocs: Vec<WordRange>,
    /// Ranges to retire if the current transaction commits.
    frees: Vec<WordRange>,
    /// Committed frees pooled until the next snapshot.
    prelimbo: Vec<WordRange>,
    /// Stamped groups awaiting quiescence, newest first.
    limbo: VecDeque<LimboGroup>,
}

impl TxAlloc {
    /// Enter the transactional epoch (even → odd).
    pub fn on_tx_begin(&mut self, slot: &Slot) {
        slot.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Allocate `len` words inside the transaction.
    pub fn alloc(&mut self, heap: &SharedHeap, len: u32) -> TxResult<Addr> {
        match heap.alloc(len) {
            Ok(addr) => {
                self.allocs.push(WordRange { start: addr, len });
                Ok(addr)
            }
            Err(_) => Err(Abort::HeapExhausted { words: len as usize }),
        }
    }

    /// Queue a free; it takes effect only if the transaction commits.
    pub fn free(&mut self, range: WordRange) {
        self.frees.push(range);
    }

    /// Commit: retire queued frees through the limbo protocol, leave the
    /// epoch (odd → even).
    pub fn on_tx_commit(&mut self, heap: &SharedHeap, registry: &Registry, slot: &Slot) {
        let frees = std::mem::take(&mut self.frees);
        for range in frees {
            self.schedule(heap, registry, range);
        }
        self.allocs.clear();
        slot.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Abort: unwind this transaction's allocations, discard its frees,
    /// leave the epoch.
    pub fn on_tx_abort(&mut self, heap: &SharedHeap, slot: &Slot) {
        for range in self.allocs.drain(..) {
            heap.release(range);
            GLOBAL_EPOCH_METRICS
                .aborted_allocs_unwound_total
                .fetch_add(1, Ordering::Relaxed);
        }
        self.frees.clear();
        slot.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Thread exit: stamp whatever is pooled and reclaim what has already
    /// quiesced. Groups still pinned by other threads stay resident until
    /// another thread's activity would have reclaimed them; with this
    /// thread gone they are abandoned.
    pub fn on_thread_exit(&mut self, heap: &SharedHeap, registry: &Registry) {
        if !self.prelimbo.is_empty() {
            self.stamp_pool(registry);
        }
        self.reclaim_dominated(heap, &Self::snapshot_epochs(registry));
        if !self.limbo.is_empty() {
            tracing::debug!(
                target: "stripetm.epoch",
                groups = self.limbo.len(),
                "abandoning unquiesced limbo groups at thread exit"
            );
        }
    }

    fn schedule(&mut self, heap: &SharedHeap, registry: &Registry, range: WordRange) {
        self.prelimbo.push(range);
        GLOBAL_EPOCH_METRICS
            .retirements_deferred_total
            .fetch_add(1, Ordering::Relaxed);
        if self.prelimbo.len() < PRELIMBO_POOL {
            return;
        }
        let stamp = self.stamp_pool(registry);
        self.reclaim_dominated(heap, &stamp);
    }

    fn snapshot_epochs(registry: &Registry) -> Vec<u64> {
        registry
            .iter()
            .map(|(_, s)| s.epoch.load(Ordering::SeqCst))
            .collect()
    }

    fn stamp_pool(&mut self, registry: &Registry) -> Vec<u64> {
        let stamp = Self::snapshot_epochs(registry);
        GLOBAL_EPOCH_METRICS
            .snapshots_taken_total
            .fetch_add(1, Ordering::Relaxed);
        self.limbo.push_front(LimboGroup {
            stamp: stamp.clone(),
            ranges: std::mem::take(&mut self.prelimbo),
        });
        stamp
    }

    /// Reclaim every group strictly dominated by `stamp`, together with
    /// everything older than it (the list is newest-first, so domination
    /// of a group extends to all groups behind it).
    fn reclaim_dominated(&mut self, heap: &SharedHeap, stamp: &[u64]) {
        let cut = self
            .limbo
            .iter()
            .position(|g| strictly_dominates(stamp, &g.stamp));
        let Some(cut) = cut else { return };
        while self.limbo.len() > cut {
            let Some(group) = self.limbo.pop_back() else {
                break;
            };
            for range in group.ranges {
                GLOBAL_EPOCH_METRICS
                    .words_reclaimed_total
                    .fetch_add(u64::from(range.len), Ordering::Relaxed);
                heap.release(range);
            }
            GLOBAL_EPOCH_METRICS
                .groups_reclaimed_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pending (unreclaimed) retirement groups; diagnostics only.
    #[must_use]
    pub fn limbo_groups(&self) -> usize {
        self.limbo.len() + usize::from(!self.prelimbo.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_registry(n: u32) -> Registry {
        let r = Registry::new();
        for _ in 0..n {
            r.claim().unwrap();
        }
        r
    }

    #[test]
    fn domination_rules() {
        // Same epochs, all even: dominated.
        assert!(strictly_dominates(&[2, 4], &[2, 4]));
        // A thread still odd at the same epoch pins the group.
        assert!(!strictly_dominates(&[3, 4], &[3, 4]));
        // The odd thread advanced: released.
        assert!(strictly_dominates(&[5, 4], &[3, 4]));
        // Odd but newer snapshot went past: released.
        assert!(strictly_dominates(&[5, 4], &[4, 4]));
    }

    #[test]
    fn abort_unwinds_allocations_immediately() {
        let heap = SharedHeap::new(64);
        let registry = quiet_registry(1);
        let slot = registry.slot(0);
        let mut ta = TxAlloc::default();

        ta.on_tx_begin(slot);
        let a = ta.alloc(&heap, 4).unwrap();
        let before = heap.available();
        ta.on_tx_abort(&heap, slot);
        // The range came back to the free list: the same alloc succeeds
        // again without touching the bump watermark.
        let b = heap.alloc(4).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.available(), before);
    }

    #[test]
    fn commit_defers_frees_until_quiescent() {
        let heap = SharedHeap::new(4096);
        let registry = quiet_registry(2);
        let slot = registry.slot(0);
        let other = registry.slot(1);
        let mut ta = TxAlloc::default();

        // Pin the second thread inside a transaction.
        other.epoch.store(1, Ordering::SeqCst);

        // Fill one pool's worth of frees across several transactions.
        for _ in 0..PRELIMBO_POOL {
            ta.on_tx_begin(slot);
            let a = ta.alloc(&heap, 1).unwrap();
            // Commit the allocation, then free it in a later transaction.
            ta.on_tx_commit(&heap, &registry, slot);
            ta.on_tx_begin(slot);
            ta.free(WordRange { start: a, len: 1 });
            ta.on_tx_commit(&heap, &registry, slot);
        }
        // Pool filled and stamped, but the pinned reader holds it.
        assert!(ta.limbo_groups() >= 1);
        let reclaimed_before = GLOBAL_EPOCH_METRICS
            .groups_reclaimed_total
            .load(Ordering::Relaxed);

        // Release the reader and push another pool through.
        other.epoch.store(2, Ordering::SeqCst);
        for _ in 0..PRELIMBO_POOL {
            ta.on_tx_begin(slot);
            let a = ta.alloc(&heap, 1).unwrap();
            ta.on_tx_commit(&heap, &registry, slot);
            ta.on_tx_begin(slot);
            ta.free(WordRange { start: a, len: 1 });
            ta.on_tx_commit(&heap, &registry, slot);
        }
        let reclaimed_after = GLOBAL_EPOCH_METRICS
            .groups_reclaimed_total
            .load(Ordering::Relaxed);
        assert!(reclaimed_after > reclaimed_before);
    }

    #[test]
    fn heap_exhaustion_maps_to_abort() {
        let heap = SharedHeap::new(2);
        let registry = quiet_registry(1);
        let slot = registry.slot(0);
        let mut ta = TxAlloc::default();
        ta.on_tx_begin(slot);
        assert!(matches!(
            ta.alloc(&heap, 100),
            Err(Abort::HeapExhausted { words: 100 })
        ));
        ta.on_tx_abort(&heap, slot);
    }
}
