//! OrecELA: lazy-acquire orecs with full privatization safety.
//!
//! Two additions over OrecLazy close both halves of the privatization
//! problem. Committers serialize their departure through the
//! last-complete counter, so a privatizer that commits at time t knows
//! every earlier writeback has finished once last_complete reaches t
//! (deferred-update half). Readers poll the clock on every read and
//! revalidate the moment anyone commits, so a doomed transaction cannot
//! act on a stale snapshot (doomed-transaction half). Snapshots start at
//! last_complete, never past it.

use std::sync::atomic::Ordering;

use stripetm_core::{
    Abort, Addr, Algorithm, BackoffCm, BeginStatus, ContentionManager, Descriptor, Mode,
    StmGlobals, TxResult, is_owned, spin_briefly,
};

use super::{
    acquire_write_orecs, finish_ro, finish_rw, merge_raw, raw_lookup, release_locks_at,
    release_locks_to_prev, validate_bound,
};

pub struct OrecELA {
    cm: BackoffCm,
}

impl OrecELA {
    #[must_use]
    pub fn new() -> Self {
        Self { cm: BackoffCm }
    }

    /// Doomed-transaction check: someone committed since the snapshot.
    /// Revalidate, then move the snapshot forward, but never past the
    /// last-complete counter (or reads would need prevalidation again).
    fn privatization_check(g: &StmGlobals, d: &mut Descriptor, ts: u64) -> TxResult<()> {
        validate_bound(g, d, d.start_time)?;
        let cs = g.last_complete.load(Ordering::SeqCst);
        d.start_time = ts.min(cs);
        Ok(())
    }
}

impl Default for OrecELA {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for OrecELA {
    fn name(&self) -> &'static str {
        "OrecELA"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn cm(&self) -> &dyn ContentionManager {
        &self.cm
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        // Start after the last cleanup, not the last commit, so begin
        // never waits out a writeback.
        d.start_time = g.last_complete.load(Ordering::SeqCst);
        d.end_time = 0;
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        if d.mode != Mode::ReadOnly {
            if let Some(v) = raw_lookup(d, addr, mask) {
                return Ok(v);
            }
        }
        let stripe = g.orecs.stripe_of(addr);
        let entry = g.orecs.entry(stripe);
        loop {
            let val = g.heap.load(addr);
            let ivt = entry.load();

            if ivt <= d.start_time {
                d.r_orecs.push(stripe);
                let ts = g.now();
                if ts != d.start_time {
                    Self::privatization_check(g, d, ts)?;
                }
                let val = if d.mode != Mode::ReadOnly {
                    merge_raw(d, addr, val, mask)
                } else {
                    val
                };
                return Ok(val);
            }

            // Locked: the writer is committing; wait out its writeback.
            if is_owned(ivt) {
                if g.switch.blocked() {
                    return Err(Abort::Swap);
                }
                spin_briefly();
                continue;
            }

            // Unlocked but too new: revalidate and scale forward, capped
            // by last_complete.
            let newts = g.now();
            validate_bound(g, d, d.start_time)?;
            let cs = g.last_complete.load(Ordering::SeqCst);
            d.start_time = newts.min(cs);
        }
    }

    fn write(
        &self,
        _g: &StmGlobals,
        d: &mut Descriptor,
        addr: Addr,
        value: u64,
        mask: u64,
    ) -> TxResult<()> {
        d.writes.insert(addr, value, mask);
        if d.mode == Mode::ReadOnly {
            d.mode = Mode::ReadWrite;
        }
        Ok(())
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        if d.mode == Mode::ReadOnly {
            finish_ro(g, d);
            return Ok(());
        }

        acquire_write_orecs(g, d)?;
        let end_time = g.advance_clock();
        d.end_time = end_time;

        if end_time != d.start_time + 1 {
            // A failure from here participates in the departure order via
            // rollback, which sees the recorded end_time.
            super::validate_owned(g, d)?;
        }

        d.writes.writeback(&g.heap);
        release_locks_at(g, d, end_time);

        // Depart in timestamp order; this closes the deferred-update half
        // of the privatization problem.
        while g.last_complete.load(Ordering::SeqCst) != end_time - 1 {
            std::hint::spin_loop();
        }
        g.last_complete.store(end_time, Ordering::SeqCst);
        d.end_time = 0;

        finish_rw(g, d);
        Ok(())
    }

    fn rollback(&self, g: &StmGlobals, d: &mut Descriptor) {
        release_locks_to_prev(g, d);
        d.reset_lists();

        // Aborted after incrementing the clock: still take the departure
        // turn, or the trailing counter would stall behind the hole.
        if d.end_time != 0 {
            while g.last_complete.load(Ordering::SeqCst) < d.end_time - 1 {
                std::hint::spin_loop();
            }
            g.last_complete.store(d.end_time, Ordering::SeqCst);
            d.end_time = 0;
        }
        d.mode = Mode::ReadOnly;
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        let now = g.raise_clock_over_marks();
        g.last_complete.store(now, Ordering::SeqCst);
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        validate_bound(g, d, d.start_time)
    }
}
