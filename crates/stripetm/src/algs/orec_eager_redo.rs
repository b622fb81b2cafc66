//! OrecEagerRedo: encounter-time locking with a redo log.
//!
//! Orecs are taken at first write like OrecEager, but values buffer in
//! the write set and publish at commit, so rollback releases locks
//! without any data undo. Commit always validates, then writes back and
//! releases at a fresh clock value.

use stripetm_core::{
    Abort, Addr, Algorithm, BackoffCm, BeginStatus, ContentionManager, Descriptor, Mode,
    StmGlobals, TxResult, is_owned,
};

use super::{
    extend_snapshot, finish_ro, finish_rw, merge_raw, raw_lookup, release_locks_at,
    release_locks_to_prev, validate_owned,
};

pub struct OrecEagerRedo {
    cm: BackoffCm,
}

impl OrecEagerRedo {
    #[must_use]
    pub fn new() -> Self {
        Self { cm: BackoffCm }
    }

    fn acquire_for_write(g: &StmGlobals, d: &mut Descriptor, addr: Addr) -> TxResult<()> {
        let stripe = g.orecs.stripe_of(addr);
        let entry = g.orecs.entry(stripe);
        loop {
            let ivt = entry.load();

            if ivt <= d.start_time {
                if !entry.try_acquire(ivt, d.my_lock) {
                    return Err(Abort::Conflict);
                }
                d.locks.push(stripe);
                return Ok(());
            }

            if ivt == d.my_lock {
                return Ok(());
            }

            if is_owned(ivt) {
                return Err(Abort::Conflict);
            }

            extend_snapshot(g, d)?;
        }
    }
}

impl Default for OrecEagerRedo {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for OrecEagerRedo {
    fn name(&self) -> &'static str {
        "OrecEagerRedo"
    }

    fn privatization_safe(&self) -> bool {
        false
    }

    fn cm(&self) -> &dyn ContentionManager {
        &self.cm
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        d.start_time = g.now();
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        let stripe = g.orecs.stripe_of(addr);
        let entry = g.orecs.entry(stripe);
        loop {
            let val = g.heap.load(addr);
            let ivt = entry.load();

            if ivt <= d.start_time {
                d.r_orecs.push(stripe);
                return Ok(val);
            }

            // Locked by us: the buffered value may shadow memory.
            if d.mode != Mode::ReadOnly && ivt == d.my_lock {
                if let Some(v) = raw_lookup(d, addr, mask) {
                    return Ok(v);
                }
                return Ok(merge_raw(d, addr, val, mask));
            }

            if is_owned(ivt) {
                return Err(Abort::Conflict);
            }

            extend_snapshot(g, d)?;
        }
    }

    fn write(
        &self,
        g: &StmGlobals,
        d: &mut Descriptor,
        addr: Addr,
        value: u64,
        mask: u64,
    ) -> TxResult<()> {
        d.writes.insert(addr, value, mask);
        Self::acquire_for_write(g, d, addr)?;
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

        // All locks held; validate, publish, release at the new time.
        validate_owned(g, d)?;
        d.writes.writeback(&g.heap);
        let end_time = g.advance_clock();
        release_locks_at(g, d, end_time);

        finish_rw(g, d);
        Ok(())
    }

    fn rollback(&self, g: &StmGlobals, d: &mut Descriptor) {
        release_locks_to_prev(g, d);
        d.reset_lists();
        d.mode = Mode::ReadOnly;
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        g.raise_clock_over_marks();
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        validate_owned(g, d)
    }
}
