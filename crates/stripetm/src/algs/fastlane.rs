//! FastlaneSwitch: one master runs in place, helpers commit through a
//! versioned counter.
//!
//! The global counter's low bit means "master active"; its high bit is
//! the master's priority request. A thread that wins the master lock at
//! begin raises priority, waits out any helper commit, swings the counter
//! odd, and runs in place, stamping orecs with the (odd) counter so
//! helpers abort against it. Helpers validate against an even counter
//! snapshot and commit one at a time under the helper lock with an
//! inc-and-swap on the counter, re-validating if it moved between the
//! first validation and the swap.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{
    Abort, Addr, Algorithm, BeginStatus, Descriptor, FL_PRIORITY_BIT, Mode, StmGlobals, TxResult,
};

use super::{finish_ro, finish_rw, merge_raw, raw_lookup};

pub struct FastlaneSwitch;

impl FastlaneSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Spin until the counter is even; returns it with the priority bit
    /// cleared.
    fn wait_for_even(g: &StmGlobals) -> u64 {
        loop {
            let c = g.fl_counter.load(Ordering::SeqCst);
            if c & 1 == 0 {
                return c & !FL_PRIORITY_BIT;
            }
            std::hint::spin_loop();
        }
    }

    /// Reads and buffered writes both still at or below the snapshot?
    fn validate_all(g: &StmGlobals, d: &Descriptor) -> bool {
        for &stripe in &d.r_orecs {
            if g.orecs.entry(stripe).load() > d.start_time {
                return false;
            }
        }
        for e in d.writes.iter() {
            if g.orecs.entry_for(e.addr).load() > d.start_time {
                return false;
            }
        }
        true
    }

    fn orec_check(g: &StmGlobals, d: &Descriptor, addr: Addr) -> TxResult<()> {
        if g.orecs.entry_for(addr).load() > d.start_time {
            return Err(Abort::Conflict);
        }
        Ok(())
    }
}

impl Default for FastlaneSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for FastlaneSwitch {
    fn name(&self) -> &'static str {
        "FastlaneSwitch"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        if g.fl_master.load(Ordering::SeqCst) == 0
            && g.fl_master
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            // Master: demand priority, wait out a committing helper, then
            // swing the counter odd.
            g.fl_counter.fetch_or(FL_PRIORITY_BIT, Ordering::SeqCst);
            loop {
                let c = g.fl_counter.load(Ordering::SeqCst);
                if c & 1 != 0 {
                    std::hint::spin_loop();
                    continue;
                }
                if g
                    .fl_counter
                    .compare_exchange(c, (c & !FL_PRIORITY_BIT) + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
            fence(Ordering::SeqCst);
            d.mode = Mode::Turbo;
            return Ok(BeginStatus::Instrumented);
        }

        // Helper: snapshot the even counter, priority bit stripped.
        d.start_time = g.fl_counter.load(Ordering::SeqCst) & !1 & !FL_PRIORITY_BIT;
        d.mode = Mode::ReadOnly;
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        match d.mode {
            Mode::Turbo => Ok(g.heap.load(addr)),
            Mode::ReadOnly => {
                let val = g.heap.load(addr);
                let stripe = g.orecs.stripe_of(addr);
                if g.orecs.entry(stripe).load() > d.start_time {
                    return Err(Abort::Conflict);
                }
                d.r_orecs.push(stripe);
                // Full revalidation keeps the snapshot consistent against
                // a master that committed mid-transaction.
                for &s in &d.r_orecs {
                    if g.orecs.entry(s).load() > d.start_time {
                        return Err(Abort::Conflict);
                    }
                }
                Ok(val)
            }
            Mode::ReadWrite => {
                if let Some(v) = raw_lookup(d, addr, mask) {
                    return Ok(v);
                }
                let val = g.heap.load(addr);
                let stripe = g.orecs.stripe_of(addr);
                if g.orecs.entry(stripe).load() > d.start_time {
                    return Err(Abort::Conflict);
                }
                d.r_orecs.push(stripe);
                for &s in &d.r_orecs {
                    if g.orecs.entry(s).load() > d.start_time {
                        return Err(Abort::Conflict);
                    }
                }
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
                // Stamp with the odd counter: helpers abort against it.
                g.orecs
                    .entry_for(addr)
                    .set_version(g.fl_counter.load(Ordering::SeqCst) & !FL_PRIORITY_BIT);
                g.heap.store_masked(addr, value, mask);
                Ok(())
            }
            Mode::ReadOnly => {
                Self::orec_check(g, d, addr)?;
                d.writes.insert(addr, value, mask);
                d.mode = Mode::ReadWrite;
                Ok(())
            }
            Mode::ReadWrite => {
                Self::orec_check(g, d, addr)?;
                d.writes.insert(addr, value, mask);
                Ok(())
            }
        }
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        match d.mode {
            Mode::Turbo => {
                fence(Ordering::SeqCst);
                // Only the master writes the counter odd → even.
                g.fl_counter.fetch_add(1, Ordering::SeqCst);
                g.fl_master.store(0, Ordering::SeqCst);
                finish_rw(g, d);
                Ok(())
            }
            Mode::ReadOnly => {
                finish_ro(g, d);
                Ok(())
            }
            Mode::ReadWrite => {
                // One helper commits at a time.
                while g
                    .fl_helper
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    std::hint::spin_loop();
                }

                let mut c = Self::wait_for_even(g);

                // Pre-validate before taking the counter.
                if !Self::validate_all(g, d) {
                    fence(Ordering::SeqCst);
                    g.fl_helper.store(0, Ordering::SeqCst);
                    return Err(Abort::Conflict);
                }
                let t = c + 1;

                while g
                    .fl_counter
                    .compare_exchange(c, c + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    c = Self::wait_for_even(g);
                }

                // The counter moved between validation and acquisition:
                // check again, releasing both on failure.
                if c + 1 > t && !Self::validate_all(g, d) {
                    g.fl_counter.fetch_sub(1, Ordering::SeqCst);
                    g.fl_helper.store(0, Ordering::SeqCst);
                    return Err(Abort::Conflict);
                }

                for e in d.writes.iter() {
                    g.orecs.entry_for(e.addr).set_version(c + 1);
                    g.heap.store_masked(e.addr, e.value, e.mask);
                }
                g.fl_counter.fetch_add(1, Ordering::SeqCst);
                g.fl_helper.store(0, Ordering::SeqCst);

                finish_rw(g, d);
                Ok(())
            }
        }
    }

    fn rollback(&self, _g: &StmGlobals, d: &mut Descriptor) {
        if d.mode == Mode::Turbo {
            crate::system::fatal("the fastlane master cannot abort");
        }
        d.reset_lists();
        d.mode = Mode::ReadOnly;
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        // Seed the counter even, at or above every published stamp.
        let now = g.raise_clock_over_marks();
        g.fl_counter.store((now + 1) & !1, Ordering::SeqCst);
        g.fl_master.store(0, Ordering::SeqCst);
        g.fl_helper.store(0, Ordering::SeqCst);
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        if d.mode != Mode::Turbo && !Self::validate_all(g, d) {
            return Err(Abort::Conflict);
        }
        Ok(())
    }
}
