//! ByteEager: bytelock reader/writer announcement with in-place update.
//!
//! Readers set their byte, then check the writer field, dropping the byte
//! and spinning when a writer holds it; writers take the owner word, drop
//! their own reader byte, and drain the rest. Every spin is bounded by an
//! iteration count that converts the stall into an abort, which is the
//! whole deadlock-avoidance story. Rollback replays the undo log and
//! backs off.

use stripetm_core::{
    Abort, Addr, Algorithm, BackoffCm, BeginStatus, ContentionManager, Descriptor, Mode,
    StmGlobals, TxResult,
};

use super::{finish_ro, finish_rw};

/// Spin bounds, in iterations.
const READ_TIMEOUT: u32 = 32;
const ACQUIRE_TIMEOUT: u32 = 128;
const DRAIN_TIMEOUT: u32 = 256;

pub struct ByteEager {
    cm: BackoffCm,
}

impl ByteEager {
    #[must_use]
    pub fn new() -> Self {
        Self { cm: BackoffCm }
    }
}

impl Default for ByteEager {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for ByteEager {
    fn name(&self) -> &'static str {
        "ByteEager"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn cm(&self) -> &dyn ContentionManager {
        &self.cm
    }

    fn begin(&self, _g: &StmGlobals, _d: &mut Descriptor) -> TxResult<BeginStatus> {
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, _mask: u64) -> TxResult<u64> {
        let stripe = g.bytelocks.stripe_of(addr);
        let lock = g.bytelocks.entry(stripe);
        let me = d.slot_id as usize;

        // Writer lock held by us: in-place values are ours to read.
        if d.mode != Mode::ReadOnly && lock.owner() == d.id {
            return Ok(g.heap.load(addr));
        }
        if lock.is_reader(me) {
            return Ok(g.heap.load(addr));
        }

        d.r_bytelocks.push(stripe);
        let mut tries = 0_u32;
        loop {
            lock.set_reader(me);
            if lock.owner() == 0 {
                return Ok(g.heap.load(addr));
            }

            // Drop the byte while the writer drains, then wait it out.
            lock.clear_reader(me);
            while lock.owner() != 0 {
                tries += 1;
                if tries > READ_TIMEOUT {
                    return Err(Abort::Timeout);
                }
                std::hint::spin_loop();
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
        let stripe = g.bytelocks.stripe_of(addr);
        let lock = g.bytelocks.entry(stripe);
        let me = d.slot_id as usize;

        if lock.owner() == d.id {
            d.undo_log.log(addr, g.heap.load(addr), mask);
            g.heap.store_masked(addr, value, mask);
            return Ok(());
        }

        let mut tries = 0_u32;
        while !lock.try_own(d.id) {
            tries += 1;
            if tries > ACQUIRE_TIMEOUT {
                return Err(Abort::Timeout);
            }
            std::hint::spin_loop();
        }
        d.w_bytelocks.push(stripe);
        lock.clear_reader(me);

        // Wait for every other reader byte to clear.
        tries = 0;
        while lock.readers_remaining(me) != 0 {
            tries += 1;
            if tries > DRAIN_TIMEOUT {
                return Err(Abort::Timeout);
            }
            std::hint::spin_loop();
        }

        d.undo_log.log(addr, g.heap.load(addr), mask);
        g.heap.store_masked(addr, value, mask);
        if d.mode == Mode::ReadOnly {
            d.mode = Mode::ReadWrite;
        }
        Ok(())
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        let me = d.slot_id as usize;
        if d.mode == Mode::ReadOnly {
            for &stripe in &d.r_bytelocks {
                g.bytelocks.entry(stripe).clear_reader(me);
            }
            finish_ro(g, d);
            return Ok(());
        }

        for &stripe in &d.w_bytelocks {
            g.bytelocks.entry(stripe).release_owner();
        }
        for &stripe in &d.r_bytelocks {
            g.bytelocks.entry(stripe).clear_reader(me);
        }
        finish_rw(g, d);
        Ok(())
    }

    fn rollback(&self, g: &StmGlobals, d: &mut Descriptor) {
        let me = d.slot_id as usize;
        d.undo_log.undo(&g.heap);
        for &stripe in &d.w_bytelocks {
            g.bytelocks.entry(stripe).release_owner();
        }
        for &stripe in &d.r_bytelocks {
            g.bytelocks.entry(stripe).clear_reader(me);
        }
        d.reset_lists();
        d.mode = Mode::ReadOnly;
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
    fn reader_byte_set_then_cleared_at_commit() {
        let (g, mut d) = setup();
        let alg = ByteEager::new();
        let a = Addr(12);
        let lock = g.bytelocks.entry_for(a);

        alg.begin(&g, &mut d).unwrap();
        let _ = alg.read(&g, &mut d, a, MASK_FULL).unwrap();
        assert!(lock.is_reader(d.slot_id as usize));
        alg.commit(&g, &mut d).unwrap();
        assert!(!lock.is_reader(d.slot_id as usize));
    }

    #[test]
    fn writer_owns_then_releases() {
        let (g, mut d) = setup();
        let alg = ByteEager::new();
        let a = Addr(20);
        let lock = g.bytelocks.entry_for(a);

        alg.begin(&g, &mut d).unwrap();
        alg.write(&g, &mut d, a, 3, MASK_FULL).unwrap();
        assert_eq!(lock.owner(), d.id);
        assert_eq!(g.heap.load(a), 3);
        alg.commit(&g, &mut d).unwrap();
        assert_eq!(lock.owner(), 0);
        assert_eq!(g.heap.load(a), 3);
    }

    #[test]
    fn contended_acquire_times_out_and_undoes() {
        let (g, mut d) = setup();
        let alg = ByteEager::new();
        let a = Addr(30);
        g.heap.store(a, 5);
        // A foreign owner that never drains.
        g.bytelocks.entry_for(a).try_own(59);

        alg.begin(&g, &mut d).unwrap();
        assert_eq!(
            alg.write(&g, &mut d, a, 9, MASK_FULL),
            Err(Abort::Timeout)
        );
        alg.rollback(&g, &mut d);
        assert_eq!(g.heap.load(a), 5);
        assert_eq!(g.bytelocks.entry_for(a).owner(), 59, "foreign lock intact");
    }

    #[test]
    fn writer_waits_out_reader_timeout() {
        let (g, mut d) = setup();
        let alg = ByteEager::new();
        let a = Addr(40);
        // A reader byte from another slot that never clears.
        g.bytelocks.entry_for(a).set_reader(59);

        alg.begin(&g, &mut d).unwrap();
        assert_eq!(
            alg.write(&g, &mut d, a, 1, MASK_FULL),
            Err(Abort::Timeout)
        );
        alg.rollback(&g, &mut d);
        assert_eq!(g.bytelocks.entry_for(a).owner(), 0, "owner released");
    }
}
