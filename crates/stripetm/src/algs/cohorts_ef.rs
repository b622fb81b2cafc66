//! CohortsEF: cohort commit with Bloom-filter conflict detection.
//!
//! Reads insert into a per-thread read filter; writes into a per-thread
//! write filter and the redo log. At commit each writer unions its write
//! filter into the shared filter after writeback; validation is a filter
//! intersection instead of a log walk. The last committer of the batch
//! clears the shared filter. The writer-in-place election is the same as
//! CohortsEN's.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{
    Abort, Addr, Algorithm, BeginStatus, Descriptor, Mode, StmGlobals, TxResult,
};

use super::{finish_ro, finish_rw, merge_raw, raw_lookup};

pub struct CohortsEF;

impl CohortsEF {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for CohortsEF {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for CohortsEF {
    fn name(&self) -> &'static str {
        "CohortsEF"
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
                d.rf.insert(addr);
                Ok(g.heap.load(addr))
            }
            Mode::ReadWrite => {
                if let Some(v) = raw_lookup(d, addr, mask) {
                    return Ok(v);
                }
                d.rf.insert(addr);
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
                g.heap.store_masked(addr, value, mask);
                Ok(())
            }
            Mode::ReadOnly => {
                if g.cpending.load(Ordering::SeqCst) + 1 == g.started.load(Ordering::SeqCst) {
                    g.inplace.swap(1, Ordering::SeqCst);
                    if g.cpending.load(Ordering::SeqCst) + 1 == g.started.load(Ordering::SeqCst) {
                        g.heap.store_masked(addr, value, mask);
                        d.mode = Mode::Turbo;
                        return Ok(());
                    }
                    g.inplace.store(0, Ordering::SeqCst);
                }
                d.wf.insert(addr);
                d.writes.insert(addr, value, mask);
                d.mode = Mode::ReadWrite;
                Ok(())
            }
            Mode::ReadWrite => {
                d.wf.insert(addr);
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
            // Last of its batch by construction.
            g.global_filter.clear();
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

        let lastone = order == g.started.load(Ordering::SeqCst);

        if g.inplace.load(Ordering::SeqCst) == 1 || order != g.last_order.load(Ordering::SeqCst) {
            if g.global_filter.intersects(&d.rf) {
                // Publish completion and do the last-one duties before
                // aborting.
                if lastone {
                    g.last_order.store(order + 1, Ordering::SeqCst);
                    g.global_filter.clear();
                }
                g.committed.fetch_add(1, Ordering::SeqCst);
                fence(Ordering::SeqCst);
                g.last_complete.store(order, Ordering::SeqCst);
                return Err(Abort::Conflict);
            }
        }

        d.writes.writeback(&g.heap);
        fence(Ordering::SeqCst);
        g.global_filter.union_from(&d.wf);
        fence(Ordering::SeqCst);

        if lastone {
            g.last_order.store(order + 1, Ordering::SeqCst);
            g.global_filter.clear();
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
        if d.mode != Mode::Turbo && g.global_filter.intersects(&d.rf) {
            return Err(Abort::Conflict);
        }
        Ok(())
    }
}
