//! CohortsEN: cohort commit with value-based validation and a
//! writer-in-place turbo path.
//!
//! The gate is the counter trio from Cohorts; reads log (address, value,
//! mask) triples and commit validates by re-reading, NOrec-style. A first
//! write that finds every other started transaction already gone elects
//! itself writer-in-place: it flips the in-place flag (double-checking
//! after the swap), writes directly, and its commit only takes a turn and
//! clears the flag. An in-place writer forces everyone in the batch to
//! validate.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{
    Abort, Addr, Algorithm, BeginStatus, Descriptor, Mode, StmGlobals, TxResult,
};

use super::{finish_ro, finish_rw, merge_raw, raw_lookup};

pub struct CohortsEN;

impl CohortsEN {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for CohortsEN {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for CohortsEN {
    fn name(&self) -> &'static str {
        "CohortsEN"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        loop {
            g.wait_or_swap(|| {
                g.cpending.load(Ordering::SeqCst) == g.committed.load(Ordering::SeqCst)
            })?;

            g.started.fetch_add(1, Ordering::SeqCst);

            if g.cpending.load(Ordering::SeqCst) > g.committed.load(Ordering::SeqCst)
                || g.inplace.load(Ordering::SeqCst) == 1
            {
                g.started.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            break;
        }
        d.ts_cache = g.last_complete.load(Ordering::SeqCst);
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        match d.mode {
            Mode::Turbo => Ok(g.heap.load(addr)),
            Mode::ReadOnly => {
                let val = g.heap.load(addr);
                d.vlist.log(addr, val, mask);
                Ok(val)
            }
            Mode::ReadWrite => {
                if let Some(v) = raw_lookup(d, addr, mask) {
                    return Ok(v);
                }
                let val = g.heap.load(addr);
                d.vlist.log(addr, val, mask);
                Ok(merge_raw(d, addr, val, mask))
            }
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
        match d.mode {
            Mode::Turbo => {
                g.heap.store_masked(addr, value, mask);
                Ok(())
            }
            Mode::ReadOnly => {
                // Everyone else is ready to commit: write in place.
                if g.cpending.load(Ordering::SeqCst) + 1 == g.started.load(Ordering::SeqCst) {
                    g.inplace.swap(1, Ordering::SeqCst);
                    if g.cpending.load(Ordering::SeqCst) + 1 == g.started.load(Ordering::SeqCst) {
                        g.heap.store_masked(addr, value, mask);
                        d.mode = Mode::Turbo;
                        return Ok(());
                    }
                    g.inplace.store(0, Ordering::SeqCst);
                }
                d.writes.insert(addr, value, mask);
                d.mode = Mode::ReadWrite;
                Ok(())
            }
            Mode::ReadWrite => {
                d.writes.insert(addr, value, mask);
                Ok(())
            }
        }
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        if d.mode == Mode::ReadOnly {
            g.started.fetch_sub(1, Ordering::SeqCst);
            finish_ro(g, d);
            return Ok(());
        }

        if d.mode == Mode::Turbo {
            let order = 1 + g.cpending.fetch_add(1, Ordering::SeqCst);
            finish_rw(g, d);

            while g.last_complete.load(Ordering::SeqCst) != order - 1 {
                std::hint::spin_loop();
            }
            g.inplace.store(0, Ordering::SeqCst);
            g.committed.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            g.last_complete.store(order, Ordering::SeqCst);
            return Ok(());
        }

        let order = 1 + g.cpending.fetch_add(1, Ordering::SeqCst);

        while g.last_complete.load(Ordering::SeqCst) != order - 1 {
            std::hint::spin_loop();
        }
        while g.cpending.load(Ordering::SeqCst) < g.started.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }

        // An in-place writer invalidates the first-committer shortcut.
        if g.inplace.load(Ordering::SeqCst) == 1 || order != g.last_order.load(Ordering::SeqCst) {
            if !d.vlist.still_valid(&g.heap) {
                if order == g.started.load(Ordering::SeqCst) {
                    g.last_order.store(order + 1, Ordering::SeqCst);
                }
                g.committed.fetch_add(1, Ordering::SeqCst);
                fence(Ordering::SeqCst);
                g.last_complete.store(order, Ordering::SeqCst);
                return Err(Abort::Conflict);
            }
        }

        d.writes.writeback(&g.heap);
        fence(Ordering::SeqCst);

        if order == g.started.load(Ordering::SeqCst) {
            g.last_order.store(order + 1, Ordering::SeqCst);
        }
        g.committed.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        g.last_complete.store(order, Ordering::SeqCst);

        finish_rw(g, d);
        Ok(())
    }

    fn rollback(&self, _g: &StmGlobals, d: &mut Descriptor) {
        if d.mode == Mode::Turbo {
            crate::system::fatal("in-place cohort writers cannot abort");
        }
        d.reset_lists();
        d.mode = Mode::ReadOnly;
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        let now = g.raise_clock_over_marks();
        g.last_complete.store(now, Ordering::SeqCst);
        g.last_order.store(now + 1, Ordering::SeqCst);
        g.started.store(now, Ordering::SeqCst);
        g.cpending.store(now, Ordering::SeqCst);
        g.committed.store(now, Ordering::SeqCst);
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        if d.mode != Mode::Turbo && !d.vlist.still_valid(&g.heap) {
            return Err(Abort::Conflict);
        }
        Ok(())
    }
}
