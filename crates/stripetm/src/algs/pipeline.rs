//! Pipeline: commit-token ordering extended to read-only transactions.
//!
//! Every transaction draws an order at begin, so the commit time is fixed
//! before the body runs. Readers also wait their turn at commit, which
//! buys strict serialization in begin order; the uniquely-oldest
//! transaction skips orec checks entirely on its reads.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{
    Abort, Addr, Algorithm, BeginStatus, Descriptor, Mode, NO_ORDER, StmGlobals, TxResult,
};

use super::{finish_ro, finish_rw, mark_and_writeback, merge_raw, raw_lookup, validate_bound};

pub struct Pipeline;

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn oldest(d: &Descriptor, order: u64) -> bool {
        d.ts_cache == order - 1
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for Pipeline {
    fn name(&self) -> &'static str {
        "Pipeline"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        let slot = g.registry.slot(d.slot_id);
        // A retried transaction keeps the order it already drew.
        if slot.order() == NO_ORDER {
            slot.set_order(g.advance_clock() as i64);
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

        let order = g.registry.slot(d.slot_id).order() as u64;
        let val = g.heap.load(addr);

        // The oldest transaction cannot be invalidated.
        if Self::oldest(d, order) {
            let val = if d.mode != Mode::ReadOnly {
                merge_raw(d, addr, val, mask)
            } else {
                val
            };
            return Ok(val);
        }

        let stripe = g.orecs.stripe_of(addr);
        if g.orecs.entry(stripe).load() > d.ts_cache {
            return Err(Abort::Conflict);
        }
        d.r_orecs.push(stripe);

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
        let order = slot.order() as u64;

        g.wait_or_swap(|| g.last_complete.load(Ordering::SeqCst) == order - 1)?;

        if !Self::oldest(d, order) {
            validate_bound(g, d, d.ts_cache)?;
        }

        let was_writer = d.mode != Mode::ReadOnly;
        if was_writer {
            // Publication cannot fail past this point.
            mark_and_writeback(g, d, order);
        }

        fence(Ordering::SeqCst);
        g.last_complete.store(order, Ordering::SeqCst);
        slot.set_order(NO_ORDER);

        if was_writer {
            finish_rw(g, d);
        } else {
            finish_ro(g, d);
        }
        Ok(())
    }

    fn rollback(&self, _g: &StmGlobals, d: &mut Descriptor) {
        // The order survives the abort; the retry commits in the same
        // turn, reader or writer.
        d.reset_lists();
        d.mode = Mode::ReadOnly;
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        let now = g.raise_clock_over_marks();
        g.last_complete.store(now, Ordering::SeqCst);
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        validate_bound(g, d, d.ts_cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use stripetm_core::{Addr, GlobalsConfig, MASK_FULL};

    fn setup() -> StmGlobals {
        StmGlobals::new(GlobalsConfig {
            heap_words: 256,
            n_stripes: 64,
        })
    }

    #[test]
    fn uniquely_oldest_reads_skip_orec_checks() {
        let g = setup();
        let alg = Pipeline::new();
        alg.on_switch_to(&g);
        let mut d1 = Descriptor::new(g.registry.claim().expect("slot"));
        let mut d2 = Descriptor::new(g.registry.claim().expect("slot"));
        let a = Addr(5);

        alg.begin(&g, &mut d1).unwrap();
        alg.begin(&g, &mut d2).unwrap();
        let o1 = g.registry.slot(d1.slot_id).order() as u64;
        assert!(Pipeline::oldest(&d1, o1), "first beginner is oldest");

        // A stamp newer than both watermarks.
        g.orecs.entry_for(a).set_version(o1);

        // The oldest transaction reads straight through it and logs no
        // orec to validate later.
        assert_eq!(alg.read(&g, &mut d1, a, MASK_FULL).unwrap(), 0);
        assert!(d1.r_orecs.is_empty());

        // The younger one must not: the stamp exceeds its watermark.
        assert!(alg.read(&g, &mut d2, a, MASK_FULL).is_err());
        alg.rollback(&g, &mut d2);

        alg.commit(&g, &mut d1).unwrap();
        assert_eq!(g.last_complete.load(Ordering::SeqCst), o1);
    }

    #[test]
    fn retried_transaction_becomes_oldest_in_its_turn() {
        let g = setup();
        let alg = Pipeline::new();
        alg.on_switch_to(&g);
        let mut d1 = Descriptor::new(g.registry.claim().expect("slot"));
        let mut d2 = Descriptor::new(g.registry.claim().expect("slot"));
        let a = Addr(6);

        alg.begin(&g, &mut d1).unwrap();
        alg.begin(&g, &mut d2).unwrap();
        let o2 = g.registry.slot(d2.slot_id).order();
        g.orecs.entry_for(a).set_version(o2 as u64 - 1);

        // The younger transaction aborts against the stamp but keeps its
        // order across the retry.
        assert!(alg.read(&g, &mut d2, a, MASK_FULL).is_err());
        alg.rollback(&g, &mut d2);
        assert_eq!(g.registry.slot(d2.slot_id).order(), o2);

        // Once the elder commits, the retry is uniquely oldest and the
        // same read sails through.
        alg.commit(&g, &mut d1).unwrap();
        alg.begin(&g, &mut d2).unwrap();
        assert_eq!(g.registry.slot(d2.slot_id).order(), o2);
        assert!(alg.read(&g, &mut d2, a, MASK_FULL).is_ok());
        assert!(d2.r_orecs.is_empty());
        alg.commit(&g, &mut d2).unwrap();
        assert_eq!(g.last_complete.load(Ordering::SeqCst), o2 as u64);
    }

    #[test]
    fn read_only_commits_take_their_turn() {
        let g = setup();
        let alg = Pipeline::new();
        alg.on_switch_to(&g);
        let mut d = Descriptor::new(g.registry.claim().expect("slot"));

        let before = g.last_complete.load(Ordering::SeqCst);
        alg.begin(&g, &mut d).unwrap();
        let _ = alg.read(&g, &mut d, Addr(1), MASK_FULL).unwrap();
        alg.commit(&g, &mut d).unwrap();
        assert_eq!(
            g.last_complete.load(Ordering::SeqCst),
            before + 1,
            "readers publish their order too"
        );
    }
}
