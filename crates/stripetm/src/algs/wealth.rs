//! Wealth: CToken with an explicitly swap-aware commit wait.
//!
//! The structure is CToken's (order at first write, strict commit order
//! behind last-complete) with the commit wait loop required to notice a
//! pending algorithm installation and self-abort, and the order released
//! eagerly after each commit.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{
    Abort, Addr, Algorithm, BeginStatus, Descriptor, Mode, NO_ORDER, StmGlobals, TxResult,
};

use super::{finish_ro, finish_rw, mark_and_writeback, merge_raw, raw_lookup, validate_bound};

pub struct Wealth;

impl Wealth {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn validate_extend(g: &StmGlobals, d: &mut Descriptor, finish: u64) -> TxResult<()> {
        if g.last_complete.load(Ordering::SeqCst) > d.ts_cache {
            validate_bound(g, d, d.ts_cache)?;
        }
        d.ts_cache = finish;
        Ok(())
    }
}

impl Default for Wealth {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for Wealth {
    fn name(&self) -> &'static str {
        "Wealth"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        d.ts_cache = g.last_complete.load(Ordering::SeqCst);
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        if d.mode != Mode::ReadOnly {
            if let Some(v) = raw_lookup(d, addr, mask) {
                return Ok(v);
            }
        }

        let stripe = g.orecs.stripe_of(addr);
        let val = g.heap.load(addr);
        if g.orecs.entry(stripe).load() > d.ts_cache {
            return Err(Abort::Conflict);
        }
        d.r_orecs.push(stripe);

        if d.mode != Mode::ReadOnly {
            let lc = g.last_complete.load(Ordering::SeqCst);
            if lc > d.ts_cache {
                Self::validate_extend(g, d, lc)?;
            }
            return Ok(merge_raw(d, addr, val, mask));
        }
        Ok(val)
    }

    fn write(
        &self,
        g: &StmGlobals,
        d: &mut Descriptor,
        addr: Addr,
        value: u64,
        mask: u64,
    ) -> TxResult<()> {
        let slot = g.registry.slot(d.slot_id);
        if slot.order() == NO_ORDER {
            slot.set_order(g.advance_clock() as i64);
        }
        d.writes.insert(addr, value, mask);
        d.mode = Mode::ReadWrite;
        Ok(())
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        let slot = g.registry.slot(d.slot_id);
        let order = slot.order();
        if order == NO_ORDER {
            finish_ro(g, d);
            return Ok(());
        }
        let order = order as u64;

        // A pending installation can be holding back the very thread this
        // turn waits on; bail out rather than deadlock the switch.
        g.wait_or_swap(|| g.last_complete.load(Ordering::SeqCst) == order - 1)?;

        Self::validate_extend(g, d, g.last_complete.load(Ordering::SeqCst))?;

        if !d.writes.is_empty() {
            mark_and_writeback(g, d, order);
        }

        fence(Ordering::SeqCst);
        g.last_complete.store(order, Ordering::SeqCst);
        slot.set_order(NO_ORDER);

        finish_rw(g, d);
        Ok(())
    }

    fn rollback(&self, g: &StmGlobals, d: &mut Descriptor) {
        d.reset_lists();
        d.mode = if g.registry.slot(d.slot_id).order() == NO_ORDER {
            Mode::ReadOnly
        } else {
            Mode::ReadWrite
        };
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        let now = g.raise_clock_over_marks();
        g.last_complete.store(now, Ordering::SeqCst);
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        validate_bound(g, d, d.ts_cache)
    }
}
