//! Cohorts: batched commit behind a counter gate.
//!
//! Transactions start freely until one reaches commit; from then on no
//! new transaction may start until the whole batch has committed, in the
//! order the committers arrived. The gate is three counters: started
//! (begins minus read-only commits), cpending (writer orders issued), and
//! committed (writer commits finished). Begin waits for cpending ==
//! committed; a writer's turn comes through last-complete; the last
//! writer of the batch skips orec marking.
//!
//! A committer that fails validation after taking its order still
//! advances committed and last-complete before aborting, so the batch
//! drains no matter what.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{Addr, Algorithm, BeginStatus, Descriptor, Mode, StmGlobals, TxResult};

use super::{finish_ro, finish_rw, merge_raw, raw_lookup, validate_bound};

pub struct Cohorts;

impl Cohorts {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for Cohorts {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for Cohorts {
    fn name(&self) -> &'static str {
        "Cohorts"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        loop {
            // Wait out a committing batch.
            g.wait_or_swap(|| {
                g.cpending.load(Ordering::SeqCst) == g.committed.load(Ordering::SeqCst)
            })?;

            g.started.fetch_add(1, Ordering::SeqCst);

            // Re-check: a writer may have sealed the batch in the window.
            if g.cpending.load(Ordering::SeqCst) > g.committed.load(Ordering::SeqCst) {
                g.started.fetch_sub(1, Ordering::SeqCst);
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
        if d.mode == Mode::ReadOnly {
            g.started.fetch_sub(1, Ordering::SeqCst);
            finish_ro(g, d);
            return Ok(());
        }

        // The first order of this batch; anyone with it skips validation.
        let first = g.last_complete.load(Ordering::SeqCst) + 1;

        // Taking an order seals the batch against new begins.
        let order = 1 + g.cpending.fetch_add(1, Ordering::SeqCst);

        // The batch drains by its own members' progress; no swap check.
        while g.last_complete.load(Ordering::SeqCst) != order - 1 {
            std::hint::spin_loop();
        }

        if order != first {
            if let Err(e) = validate_bound(g, d, d.ts_cache) {
                // Publish completion before aborting so the batch drains.
                g.committed.fetch_add(1, Ordering::SeqCst);
                fence(Ordering::SeqCst);
                g.last_complete.store(order, Ordering::SeqCst);
                return Err(e);
            }
        }

        // The last writer of the batch can skip orec marking: nobody
        // after it will validate against these stamps.
        if order != g.started.load(Ordering::SeqCst) {
            for e in d.writes.iter() {
                g.orecs.entry_for(e.addr).set_version(order);
            }
        }

        // Wait until every started transaction has either finished
        // read-only or taken an order.
        while g.cpending.load(Ordering::SeqCst) < g.started.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }

        d.writes.writeback(&g.heap);

        g.committed.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        g.last_complete.store(order, Ordering::SeqCst);

        finish_rw(g, d);
        Ok(())
    }

    fn rollback(&self, _g: &StmGlobals, d: &mut Descriptor) {
        d.reset_lists();
        d.mode = Mode::ReadOnly;
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        // Orders continue from the raised clock so stamps left by other
        // algorithms can never exceed a fresh ts_cache.
        let now = g.raise_clock_over_marks();
        g.last_complete.store(now, Ordering::SeqCst);
        g.started.store(now, Ordering::SeqCst);
        g.cpending.store(now, Ordering::SeqCst);
        g.committed.store(now, Ordering::SeqCst);
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        validate_bound(g, d, d.ts_cache)
    }
}
