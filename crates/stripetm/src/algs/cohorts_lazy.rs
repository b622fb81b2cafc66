//! CohortsLazy: batched commit behind a gatekeeper flag and a registry
//! status scan.
//!
//! Instead of the counter gate, the first committer raises a gatekeeper
//! flag; begin double-checks it around publishing STARTED. Committers
//! draw orders from the global clock, wait for every STARTED transaction
//! to leave that state, commit in order, and the last CPENDING clears
//! the gatekeeper for the next batch.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{
    Addr, Algorithm, BeginStatus, Descriptor, Mode, StmGlobals, TxResult, status,
};

use super::{finish_ro, finish_rw, merge_raw, raw_lookup, validate_bound};

pub struct CohortsLazy;

impl CohortsLazy {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Last-one bookkeeping: when nobody is left pending, open the next
    /// batch.
    fn maybe_open_gate(g: &StmGlobals, order: u64) {
        let lastone = g
            .registry
            .iter()
            .all(|(_, s)| s.status() != status::CPENDING);
        if lastone {
            g.last_order.store(order + 1, Ordering::SeqCst);
            g.gatekeeper.store(0, Ordering::SeqCst);
        }
    }
}

impl Default for CohortsLazy {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for CohortsLazy {
    fn name(&self) -> &'static str {
        "CohortsLazy"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        let slot = g.registry.slot(d.slot_id);
        loop {
            g.wait_or_swap(|| g.gatekeeper.load(Ordering::SeqCst) == 0)?;

            slot.set_status(status::STARTED);
            fence(Ordering::SeqCst);

            if g.gatekeeper.load(Ordering::SeqCst) != 0 {
                slot.set_status(status::COMMITTED);
                continue;
            }
            break;
        }
        d.ts_cache = g.last_complete.load(Ordering::SeqCst);
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        if d.mode != Mode::ReadOnly {
            if let Some(v) = raw_lookup(d, addr, mask) {
                return Ok(v);
            }
        }
        d.r_orecs.push(g.orecs.stripe_of(addr));
        let val = g.heap.load(addr);
        let val = if d.mode != Mode::ReadOnly {
            merge_raw(d, addr, val, mask)
        } else {
            val
        };
        Ok(val)
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
        d.mode = Mode::ReadWrite;
        Ok(())
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        let slot = g.registry.slot(d.slot_id);

        if d.mode == Mode::ReadOnly {
            slot.set_status(status::COMMITTED);
            finish_ro(g, d);
            return Ok(());
        }

        // Seal the batch and join the commit order.
        g.gatekeeper.store(1, Ordering::SeqCst);
        slot.set_status(status::CPENDING);
        let order = g.advance_clock();

        // Wait for every member to stop running user code, then for the
        // turn. Both depend only on members' own progress.
        for (_, s) in g.registry.iter() {
            while s.status() == status::STARTED {
                std::hint::spin_loop();
            }
        }
        while g.last_complete.load(Ordering::SeqCst) != order - 1 {
            std::hint::spin_loop();
        }

        // First in the batch skips validation.
        if order != g.last_order.load(Ordering::SeqCst) {
            if let Err(e) = validate_bound(g, d, d.ts_cache) {
                // Publish completion and do the last-one duties before
                // aborting, or the batch never drains.
                g.last_complete.store(order, Ordering::SeqCst);
                slot.set_status(status::COMMITTED);
                fence(Ordering::SeqCst);
                Self::maybe_open_gate(g, order);
                return Err(e);
            }
        }

        for e in d.writes.iter() {
            g.orecs.entry_for(e.addr).set_version(order);
            g.heap.store_masked(e.addr, e.value, e.mask);
        }
        fence(Ordering::SeqCst);

        g.last_complete.store(order, Ordering::SeqCst);
        slot.set_status(status::COMMITTED);
        fence(Ordering::SeqCst);
        Self::maybe_open_gate(g, order);

        finish_rw(g, d);
        Ok(())
    }

    fn rollback(&self, g: &StmGlobals, d: &mut Descriptor) {
        g.registry.slot(d.slot_id).set_status(status::COMMITTED);
        d.reset_lists();
        d.mode = Mode::ReadOnly;
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        let now = g.raise_clock_over_marks();
        g.last_complete.store(now, Ordering::SeqCst);
        g.last_order.store(now + 1, Ordering::SeqCst);
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        validate_bound(g, d, d.ts_cache)
    }
}
