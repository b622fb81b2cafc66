//! CohortsLI: gatekeeper cohorts with an in-place turbo election by
//! registry scan.
//!
//! Orec-list validation as in CohortsLazy. A first write that scans the
//! registry and finds itself the only STARTED transaction elects
//! writer-in-place: flip the flag with a swap, re-scan to confirm, then
//! write directly (stamping each orec at last-complete + 1). Everyone
//! else in a batch containing an in-place writer must validate.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{
    Addr, Algorithm, BeginStatus, Descriptor, Mode, StmGlobals, TxResult, status,
};

use super::{finish_ro, finish_rw, merge_raw, raw_lookup, validate_bound};

pub struct CohortsLI;

impl CohortsLI {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn started_count(g: &StmGlobals) -> usize {
        g.registry
            .iter()
            .filter(|(_, s)| s.status() == status::STARTED)
            .count()
    }

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

impl Default for CohortsLI {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for CohortsLI {
    fn name(&self) -> &'static str {
        "CohortsLI"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        let slot = g.registry.slot(d.slot_id);
        loop {
            g.wait_or_swap(|| g.gatekeeper.load(Ordering::SeqCst) == 0)?;

            slot.status.swap(status::STARTED, Ordering::SeqCst);

            if g.gatekeeper.load(Ordering::SeqCst) == 1 || g.inplace.load(Ordering::SeqCst) == 1 {
                slot.set_status(status::COMMITTED);
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
                d.r_orecs.push(g.orecs.stripe_of(addr));
                Ok(g.heap.load(addr))
            }
            Mode::ReadWrite => {
                if let Some(v) = raw_lookup(d, addr, mask) {
                    return Ok(v);
                }
                d.r_orecs.push(g.orecs.stripe_of(addr));
                let val = g.heap.load(addr);
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
                g.orecs
                    .entry_for(addr)
                    .set_version(g.last_complete.load(Ordering::SeqCst) + 1);
                g.heap.store_masked(addr, value, mask);
                Ok(())
            }
            Mode::ReadOnly => {
                // Sole survivor election: flip the flag, then confirm.
                if Self::started_count(g) == 1 {
                    g.inplace.swap(1, Ordering::SeqCst);
                    if Self::started_count(g) == 1 {
                        g.orecs
                            .entry_for(addr)
                            .set_version(g.last_complete.load(Ordering::SeqCst) + 1);
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
        let slot = g.registry.slot(d.slot_id);

        if d.mode == Mode::ReadOnly {
            slot.set_status(status::COMMITTED);
            finish_ro(g, d);
            return Ok(());
        }

        if d.mode == Mode::Turbo {
            slot.set_status(status::CPENDING);
            let order = g.advance_clock();
            finish_rw(g, d);

            while g.last_complete.load(Ordering::SeqCst) != order - 1 {
                std::hint::spin_loop();
            }
            g.last_complete.store(order, Ordering::SeqCst);
            // The in-place writer is the whole batch.
            g.last_order.store(order + 1, Ordering::SeqCst);
            g.gatekeeper.store(0, Ordering::SeqCst);
            g.inplace.store(0, Ordering::SeqCst);
            slot.set_status(status::COMMITTED);
            return Ok(());
        }

        g.gatekeeper.store(1, Ordering::SeqCst);
        let order = g.advance_clock();
        slot.set_status(status::CPENDING);

        for (_, s) in g.registry.iter() {
            while s.status() == status::STARTED {
                std::hint::spin_loop();
            }
        }
        while g.last_complete.load(Ordering::SeqCst) != order - 1 {
            std::hint::spin_loop();
        }

        if g.inplace.load(Ordering::SeqCst) == 1 || order != g.last_order.load(Ordering::SeqCst) {
            if let Err(e) = validate_bound(g, d, d.ts_cache) {
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
        if d.mode == Mode::Turbo {
            crate::system::fatal("in-place cohort writers cannot abort");
        }
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
        if d.mode == Mode::Turbo {
            return Ok(());
        }
        validate_bound(g, d, d.ts_cache)
    }
}
