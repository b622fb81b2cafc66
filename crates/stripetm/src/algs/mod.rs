//! The concurrency-control algorithms.
//!
//! One module per family. Everything here implements the dispatch
//! contract from `stripetm_core::dispatch`; the helpers below are the
//! handful of moves nearly every family makes (orec validation, snapshot
//! extension, lazy lock acquisition, ordered mark-and-writeback,
//! commit-side bookkeeping).

use std::sync::atomic::Ordering;

use stripetm_core::{Abort, AlgorithmTable, Descriptor, Mode, StmGlobals, TxResult};

mod bit_eager;
mod byte_eager;
mod cohorts;
mod cohorts_ef;
mod cohorts_en;
mod cohorts_lazy;
mod cohorts_li;
mod cohorts_lnqx;
mod ctoken;
mod fastlane;
mod norec;
mod orec_eager;
mod orec_eager_redo;
mod orec_ela;
mod orec_lazy;
mod pipeline;
mod wealth;

pub use bit_eager::BitEager;
pub use byte_eager::ByteEager;
pub use cohorts::Cohorts;
pub use cohorts_ef::CohortsEF;
pub use cohorts_en::CohortsEN;
pub use cohorts_lazy::CohortsLazy;
pub use cohorts_li::CohortsLI;
pub use cohorts_lnqx::CohortsLNQX;
pub use ctoken::{CToken, CTokenTurbo};
pub use fastlane::FastlaneSwitch;
pub use norec::NOrec;
pub use orec_eager::OrecEager;
pub use orec_eager_redo::OrecEagerRedo;
pub use orec_ela::OrecELA;
pub use orec_lazy::{Llt, OrecLazy};
pub use pipeline::Pipeline;
pub use wealth::Wealth;

/// Register every bundled algorithm, in stable order.
pub fn register_all(table: &mut AlgorithmTable) {
    table.register(Box::new(NOrec::new()));
    table.register(Box::new(OrecEager::new()));
    table.register(Box::new(OrecEagerRedo::new()));
    table.register(Box::new(OrecLazy::new()));
    table.register(Box::new(Llt::new()));
    table.register(Box::new(OrecELA::new()));
    table.register(Box::new(ByteEager::new()));
    table.register(Box::new(BitEager::new()));
    table.register(Box::new(CToken::new()));
    table.register(Box::new(CTokenTurbo::new()));
    table.register(Box::new(Pipeline::new()));
    table.register(Box::new(Wealth::new()));
    table.register(Box::new(Cohorts::new()));
    table.register(Box::new(CohortsLazy::new()));
    table.register(Box::new(CohortsEN::new()));
    table.register(Box::new(CohortsEF::new()));
    table.register(Box::new(CohortsLI::new()));
    table.register(Box::new(CohortsLNQX::new()));
    table.register(Box::new(FastlaneSwitch::new()));
}

// ---------------------------------------------------------------------------
// Shared moves
// ---------------------------------------------------------------------------

/// Read-only commit bookkeeping: count it, feed the toxic histogram,
/// clear the logs, drop back to read-only dispatch.
pub(crate) fn finish_ro(g: &StmGlobals, d: &mut Descriptor) {
    let slot = g.registry.slot(d.slot_id);
    slot.commits_ro.fetch_add(1, Ordering::Relaxed);
    d.abort_hist.on_commit(d.consec_aborts);
    d.consec_aborts = 0;
    d.reset_lists();
    d.mode = Mode::ReadOnly;
}

/// Writer commit bookkeeping.
pub(crate) fn finish_rw(g: &StmGlobals, d: &mut Descriptor) {
    let slot = g.registry.slot(d.slot_id);
    slot.commits_rw.fetch_add(1, Ordering::Relaxed);
    d.abort_hist.on_commit(d.consec_aborts);
    d.consec_aborts = 0;
    d.reset_lists();
    d.mode = Mode::ReadOnly;
}

/// Validate the orec read log against `d.start_time`, excusing orecs this
/// thread owns.
pub(crate) fn validate_owned(g: &StmGlobals, d: &Descriptor) -> TxResult<()> {
    for &stripe in &d.r_orecs {
        let v = g.orecs.entry(stripe).load();
        if v > d.start_time && v != d.my_lock {
            return Err(Abort::Conflict);
        }
    }
    Ok(())
}

/// Validate the orec read log against an arbitrary bound; a lock
/// encoding always exceeds the bound, so owned orecs fail too.
pub(crate) fn validate_bound(g: &StmGlobals, d: &Descriptor, bound: u64) -> TxResult<()> {
    for &stripe in &d.r_orecs {
        if g.orecs.entry(stripe).load() > bound {
            return Err(Abort::Conflict);
        }
    }
    Ok(())
}

/// Scale the snapshot forward: revalidate at the current clock, then
/// adopt it as the new start time. Guarantees progress for repeated
/// version-too-new retries because the clock is monotone.
pub(crate) fn extend_snapshot(g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
    let newts = g.now();
    validate_owned(g, d)?;
    d.start_time = newts;
    Ok(())
}

/// Lazy acquisition: take the orec of every buffered write, saving prior
/// versions. Accepts orecs already owned by this thread (several
/// addresses can share a stripe); any foreign owner or too-new version
/// aborts.
pub(crate) fn acquire_write_orecs(g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
    for i in 0..d.writes.len() {
        let e = d.writes.entry_at(i);
        let stripe = g.orecs.stripe_of(e.addr);
        let entry = g.orecs.entry(stripe);
        let v = entry.load();
        if v <= d.start_time {
            if !entry.try_acquire(v, d.my_lock) {
                return Err(Abort::Conflict);
            }
            d.locks.push(stripe);
        } else if v != d.my_lock {
            return Err(Abort::Conflict);
        }
    }
    Ok(())
}

/// Release every held orec at `version`.
pub(crate) fn release_locks_at(g: &StmGlobals, d: &Descriptor, version: u64) {
    for &stripe in &d.locks {
        g.orecs.entry(stripe).set_version(version);
    }
}

/// Release every held orec back to its pre-acquisition version.
pub(crate) fn release_locks_to_prev(g: &StmGlobals, d: &Descriptor) {
    for &stripe in &d.locks {
        let e = g.orecs.entry(stripe);
        let prev = e.prev();
        e.set_version(prev);
    }
}

/// Ordered publication: stamp each written orec with `version`, then
/// write the value back. The stamp's release store orders it before the
/// data store on this thread.
pub(crate) fn mark_and_writeback(g: &StmGlobals, d: &Descriptor, version: u64) {
    for e in d.writes.iter() {
        g.orecs.entry_for(e.addr).set_version(version);
        g.heap.store_masked(e.addr, e.value, e.mask);
    }
}

/// Resolve a read-after-write against the redo log. `Some(v)` means the
/// log fully covers the requested lanes; `None` means the caller must
/// read memory (and then merge with [`merge_raw`]).
pub(crate) fn raw_lookup(d: &Descriptor, addr: stripetm_core::Addr, mask: u64) -> Option<u64> {
    match d.writes.find(addr) {
        Some(e) if e.mask & mask == mask => Some(e.value),
        _ => None,
    }
}

/// Merge logged lanes over a freshly read memory value.
pub(crate) fn merge_raw(d: &Descriptor, addr: stripetm_core::Addr, mem: u64, mask: u64) -> u64 {
    d.writes.resolve_read(addr, mem, mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_stable() {
        let mut table = AlgorithmTable::new();
        register_all(&mut table);
        let names: Vec<_> = table.names().collect();
        assert_eq!(names.len(), 19);
        assert_eq!(table.index_of("NOrec").unwrap(), 0);
        for expected in [
            "OrecEager",
            "LLT",
            "ByteEager",
            "BitEager",
            "CTokenTurbo",
            "Pipeline",
            "Wealth",
            "CohortsLNQX",
            "FastlaneSwitch",
        ] {
            assert!(table.index_of(expected).is_ok(), "missing {expected}");
        }
    }
}
