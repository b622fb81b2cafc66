//! The commit-token algorithms: CToken and CTokenTurbo.
//!
//! A writer takes an order from the clock at its first write and commits
//! strictly in order behind the last-complete counter; reads abort when
//! an orec carries a stamp newer than the last completion the reader has
//! seen. An aborted writer keeps its order and must still commit in turn
//! (even if its retry does no writes), so the pipeline never develops a
//! hole. Turbo adds an in-place phase for the thread that proves it is
//! uniquely oldest.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{
    Abort, Addr, Algorithm, BeginStatus, Descriptor, Mode, NO_ORDER, StmGlobals, TxResult,
};

use super::{finish_ro, finish_rw, mark_and_writeback, merge_raw, raw_lookup, validate_bound};

/// Validate against the last completion this transaction has seen, then
/// remember `finish` as the new completion watermark.
fn validate_extend(g: &StmGlobals, d: &mut Descriptor, finish: u64) -> TxResult<()> {
    if g.last_complete.load(Ordering::SeqCst) > d.ts_cache {
        validate_bound(g, d, d.ts_cache)?;
    }
    d.ts_cache = finish;
    Ok(())
}

fn token_read(g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
    if d.mode != Mode::ReadOnly {
        if let Some(v) = raw_lookup(d, addr, mask) {
            return Ok(v);
        }
    }

    let stripe = g.orecs.stripe_of(addr);
    let val = g.heap.load(addr);
    let ivt = g.orecs.entry(stripe).load();
    if ivt > d.ts_cache {
        return Err(Abort::Conflict);
    }
    d.r_orecs.push(stripe);

    let lc = g.last_complete.load(Ordering::SeqCst);
    if lc > d.ts_cache {
        validate_extend(g, d, lc)?;
    }

    let val = if d.mode != Mode::ReadOnly {
        merge_raw(d, addr, val, mask)
    } else {
        val
    };
    Ok(val)
}

fn token_rollback(g: &StmGlobals, d: &mut Descriptor) {
    d.reset_lists();
    // A writer keeps its order across the abort and must re-commit in
    // turn; dispatch stays on the writer path.
    d.mode = if g.registry.slot(d.slot_id).order() == NO_ORDER {
        Mode::ReadOnly
    } else {
        Mode::ReadWrite
    };
}

pub struct CToken;

impl CToken {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for CToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for CToken {
    fn name(&self) -> &'static str {
        "CToken"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        d.ts_cache = g.last_complete.load(Ordering::SeqCst);
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        token_read(g, d, addr, mask)
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

        g.wait_or_swap(|| g.last_complete.load(Ordering::SeqCst) == order - 1)?;

        if order - 1 > d.ts_cache {
            validate_bound(g, d, d.ts_cache)?;
        }

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
        token_rollback(g, d);
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        let now = g.raise_clock_over_marks();
        g.last_complete.store(now, Ordering::SeqCst);
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        validate_bound(g, d, d.ts_cache)
    }
}

pub struct CTokenTurbo;

impl CTokenTurbo {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate-extend, then enter the in-place phase if this thread has
    /// become uniquely oldest: publish the whole redo log (stamped with
    /// the order) and stop logging.
    fn validate_maybe_turbo(g: &StmGlobals, d: &mut Descriptor, finish: u64) -> TxResult<()> {
        validate_extend(g, d, finish)?;
        let order = g.registry.slot(d.slot_id).order();
        if order != NO_ORDER && d.ts_cache == (order as u64) - 1 && !d.writes.is_empty() {
            mark_and_writeback(g, d, order as u64);
            d.mode = Mode::Turbo;
        }
        Ok(())
    }
}

impl Default for CTokenTurbo {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for CTokenTurbo {
    fn name(&self) -> &'static str {
        "CTokenTurbo"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        d.ts_cache = g.last_complete.load(Ordering::SeqCst);

        // An aborted writer that is already oldest re-enters in place.
        let order = g.registry.slot(d.slot_id).order();
        if order != NO_ORDER && d.ts_cache == (order as u64) - 1 {
            d.mode = Mode::Turbo;
        }
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        if d.mode == Mode::Turbo {
            return Ok(g.heap.load(addr));
        }
        token_read(g, d, addr, mask)
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
                let slot = g.registry.slot(d.slot_id);
                g.orecs.entry_for(addr).set_version(slot.order() as u64);
                g.heap.store_masked(addr, value, mask);
                Ok(())
            }
            Mode::ReadOnly => {
                let slot = g.registry.slot(d.slot_id);
                if slot.order() == NO_ORDER {
                    slot.set_order(g.advance_clock() as i64);
                }
                d.writes.insert(addr, value, mask);
                d.mode = Mode::ReadWrite;
                // First write: now that there is an order, the turbo test
                // is allowed.
                Self::validate_maybe_turbo(g, d, g.last_complete.load(Ordering::SeqCst))
            }
            Mode::ReadWrite => {
                d.writes.insert(addr, value, mask);
                Ok(())
            }
        }
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        let slot = g.registry.slot(d.slot_id);
        let order = slot.order();

        if d.mode == Mode::Turbo {
            fence(Ordering::SeqCst);
            g.last_complete.store(order as u64, Ordering::SeqCst);
            slot.set_order(NO_ORDER);
            finish_rw(g, d);
            return Ok(());
        }

        if order == NO_ORDER {
            finish_ro(g, d);
            return Ok(());
        }
        let order = order as u64;

        g.wait_or_swap(|| g.last_complete.load(Ordering::SeqCst) == order - 1)?;

        // The oldest transaction skips validation.
        if d.ts_cache != order - 1 {
            validate_bound(g, d, d.ts_cache)?;
        }

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
        if d.mode == Mode::Turbo {
            crate::system::fatal("turbo-mode transactions cannot abort");
        }
        token_rollback(g, d);
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        let now = g.raise_clock_over_marks();
        g.last_complete.store(now, Ordering::SeqCst);
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        if d.mode == Mode::Turbo {
            return Ok(());
        }
        validate_bound(g, d, d.ts_cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripetm_core::{Addr, GlobalsConfig, MASK_FULL};

    fn setup() -> (StmGlobals, Descriptor) {
        let g = StmGlobals::new(GlobalsConfig {
            heap_words: 256,
            n_stripes: 64,
        });
        let slot = g.registry.claim().expect("slot");
        (g, Descriptor::new(slot))
    }

    #[test]
    fn writer_takes_an_order_and_stamps_orecs() {
        let (g, mut d) = setup();
        let alg = CToken::new();
        alg.on_switch_to(&g);
        let a = Addr(10);

        alg.begin(&g, &mut d).unwrap();
        alg.write(&g, &mut d, a, 8, MASK_FULL).unwrap();
        let order = g.registry.slot(d.slot_id).order();
        assert!(order > 0);
        alg.commit(&g, &mut d).unwrap();

        assert_eq!(g.heap.load(a), 8);
        assert_eq!(g.orecs.entry_for(a).load(), order as u64);
        assert_eq!(
            g.last_complete.load(std::sync::atomic::Ordering::SeqCst),
            order as u64
        );
        assert_eq!(g.registry.slot(d.slot_id).order(), NO_ORDER);
    }

    #[test]
    fn stale_read_aborts_against_the_completion_watermark() {
        let (g, mut d) = setup();
        let alg = CToken::new();
        alg.on_switch_to(&g);
        let a = Addr(11);

        alg.begin(&g, &mut d).unwrap();
        // A later committer stamps the stripe past our watermark.
        let newer = g.advance_clock();
        g.orecs.entry_for(a).set_version(newer);
        g.last_complete
            .store(newer, std::sync::atomic::Ordering::SeqCst);

        assert!(alg.read(&g, &mut d, a, MASK_FULL).is_err());
        alg.rollback(&g, &mut d);
        assert_eq!(d.mode, Mode::ReadOnly, "no order was held");
    }

    #[test]
    fn aborted_writer_keeps_its_order_and_recommits_in_turn() {
        let (g, mut d) = setup();
        let alg = CToken::new();
        alg.on_switch_to(&g);
        let a = Addr(12);

        alg.begin(&g, &mut d).unwrap();
        alg.write(&g, &mut d, a, 1, MASK_FULL).unwrap();
        let order = g.registry.slot(d.slot_id).order();
        alg.rollback(&g, &mut d);

        assert_eq!(g.registry.slot(d.slot_id).order(), order);
        assert_eq!(d.mode, Mode::ReadWrite, "must re-commit on the writer path");

        // The retry does no writes but still publishes its turn.
        alg.begin(&g, &mut d).unwrap();
        alg.commit(&g, &mut d).unwrap();
        assert_eq!(
            g.last_complete.load(std::sync::atomic::Ordering::SeqCst),
            order as u64
        );
        assert_eq!(g.registry.slot(d.slot_id).order(), NO_ORDER);
    }

    #[test]
    fn turbo_entry_for_the_uniquely_oldest_writer() {
        let (g, mut d) = setup();
        let alg = CTokenTurbo::new();
        alg.on_switch_to(&g);
        let a = Addr(13);

        alg.begin(&g, &mut d).unwrap();
        // First write of the only active transaction: uniquely oldest, so
        // the turbo test fires and publishes in place.
        alg.write(&g, &mut d, a, 5, MASK_FULL).unwrap();
        assert_eq!(d.mode, Mode::Turbo);
        assert_eq!(g.heap.load(a), 5, "published at turbo entry");

        alg.write(&g, &mut d, a, 6, MASK_FULL).unwrap();
        assert_eq!(g.heap.load(a), 6, "turbo writes go straight through");

        let order = g.registry.slot(d.slot_id).order() as u64;
        alg.commit(&g, &mut d).unwrap();
        assert_eq!(
            g.last_complete.load(std::sync::atomic::Ordering::SeqCst),
            order
        );
    }
}
