//! CohortsLNQX: queue-ordered cohorts with value validation, a
//! writer-in-place turbo path, and early sealing.
//!
//! Committers enqueue themselves by swapping their slot into the queue
//! head and wait on their predecessor's turn word; the queue replaces the
//! gatekeeper-and-scan pattern (the first in line still scans once for
//! stragglers). Every committer validates its value log. A first write
//! that finds every other started transaction gone elects writer-in-place
//! exactly as CohortsEN does; the in-place committer takes a queue turn
//! but validates and writes back nothing. A cohort can be sealed early,
//! blocking further begins, when a member crosses the configured read
//! count, write count, or consecutive-abort thresholds; the last
//! transaction to leave the queue clears the seal.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{
    Abort, Addr, Algorithm, BeginStatus, Descriptor, Mode, StmGlobals, TxResult, status, turn,
};

use super::{finish_ro, finish_rw, merge_raw, raw_lookup};

pub struct CohortsLNQX;

impl CohortsLNQX {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Leave the commit queue: mark our turn done, and if we are still
    /// the tail, reset the queue and lift the seal.
    fn leave_queue(g: &StmGlobals, slot_id: u32) {
        let me = slot_id + 1;
        g.registry.slot(slot_id).turn.store(turn::DONE, Ordering::SeqCst);
        if g
            .commit_queue
            .compare_exchange(me, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            g.sealed.store(0, Ordering::SeqCst);
        }
    }

    /// Sole-survivor check: no slot but ours is still running user code.
    fn alone_started(g: &StmGlobals, slot_id: u32) -> bool {
        g.registry
            .iter()
            .all(|(i, s)| i == slot_id || s.status() != status::STARTED)
    }

    /// Enqueue and wait for the turn: behind the predecessor's turn word,
    /// or, first in line, behind every straggler still running.
    fn take_turn(g: &StmGlobals, slot_id: u32) {
        let pred = g.commit_queue.swap(slot_id + 1, Ordering::SeqCst);
        g.registry.slot(slot_id).set_status(status::CPENDING);
        fence(Ordering::SeqCst);

        if pred != 0 {
            let p = g.registry.slot(pred - 1);
            while p.turn.load(Ordering::SeqCst) != turn::DONE {
                std::hint::spin_loop();
            }
        } else {
            for (_, s) in g.registry.iter() {
                while s.status() == status::STARTED {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

impl Default for CohortsLNQX {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for CohortsLNQX {
    fn name(&self) -> &'static str {
        "CohortsLNQX"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        let slot = g.registry.slot(d.slot_id);
        loop {
            // Blocked while a batch is committing, sealed, or a writer is
            // running in place.
            g.wait_or_swap(|| {
                g.commit_queue.load(Ordering::SeqCst) == 0
                    && g.sealed.load(Ordering::SeqCst) == 0
                    && g.inplace.load(Ordering::SeqCst) == 0
            })?;

            slot.set_status(status::STARTED);
            fence(Ordering::SeqCst);

            if g.commit_queue.load(Ordering::SeqCst) != 0
                || g.sealed.load(Ordering::SeqCst) == 1
                || g.inplace.load(Ordering::SeqCst) == 1
            {
                slot.set_status(status::COMMITTED);
                continue;
            }
            break;
        }

        slot.turn.store(turn::NOT_DONE, Ordering::SeqCst);
        d.cohort_reads = 0;
        d.cohort_writes = 0;

        let abort_seal = g.seal_thresholds.aborts.load(Ordering::SeqCst);
        if abort_seal >= 0 && i64::from(d.cohort_aborts) == abort_seal {
            g.sealed.swap(1, Ordering::SeqCst);
            d.cohort_aborts = 0;
        }
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        match d.mode {
            Mode::Turbo => Ok(g.heap.load(addr)),
            Mode::ReadOnly => {
                d.cohort_reads += 1;
                let read_seal = g.seal_thresholds.reads.load(Ordering::SeqCst);
                if read_seal >= 0 && i64::from(d.cohort_reads) == read_seal {
                    g.sealed.swap(1, Ordering::SeqCst);
                }
                let val = g.heap.load(addr);
                d.vlist.log(addr, val, mask);
                Ok(val)
            }
            Mode::ReadWrite => {
                if let Some(v) = raw_lookup(d, addr, mask) {
                    return Ok(v);
                }
                d.cohort_reads += 1;
                let read_seal = g.seal_thresholds.reads.load(Ordering::SeqCst);
                if read_seal >= 0 && i64::from(d.cohort_reads) == read_seal {
                    g.sealed.swap(1, Ordering::SeqCst);
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
                // Everyone else has left STARTED: write in place.
                if Self::alone_started(g, d.slot_id) {
                    g.inplace.swap(1, Ordering::SeqCst);
                    if Self::alone_started(g, d.slot_id) {
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
                d.cohort_writes += 1;
                let write_seal = g.seal_thresholds.writes.load(Ordering::SeqCst);
                if write_seal >= 0 && i64::from(d.cohort_writes) == write_seal {
                    g.sealed.swap(1, Ordering::SeqCst);
                }
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
            // In-place writes are already published; just take a queue
            // turn and hand the cohort back.
            Self::take_turn(g, d.slot_id);
            g.inplace.store(0, Ordering::SeqCst);
            Self::leave_queue(g, d.slot_id);
            slot.set_status(status::COMMITTED);
            finish_rw(g, d);
            return Ok(());
        }

        Self::take_turn(g, d.slot_id);

        // Everyone validates.
        if !d.vlist.still_valid(&g.heap) {
            d.cohort_aborts += 1;
            Self::leave_queue(g, d.slot_id);
            slot.set_status(status::COMMITTED);
            return Err(Abort::Conflict);
        }

        d.writes.writeback(&g.heap);
        fence(Ordering::SeqCst);

        Self::leave_queue(g, d.slot_id);
        slot.set_status(status::COMMITTED);

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
        g.raise_clock_over_marks();
        tracing::info!(
            target: "stripetm.config",
            reads = g.seal_thresholds.reads.load(Ordering::SeqCst),
            writes = g.seal_thresholds.writes.load(Ordering::SeqCst),
            aborts = g.seal_thresholds.aborts.load(Ordering::SeqCst),
            "early-seal thresholds"
        );
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        if d.mode != Mode::Turbo && !d.vlist.still_valid(&g.heap) {
            return Err(Abort::Conflict);
        }
        Ok(())
    }
}
