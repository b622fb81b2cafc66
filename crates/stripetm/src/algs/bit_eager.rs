//! BitEager: the bitlock rendition of eager reader/writer announcement.
//!
//! Same shape as ByteEager with reader records packed into bitset words:
//! a reader announces with an atomic bit set, a writer owns the lock word
//! and drains the bits. Bounded spins convert stalls into aborts.

use stripetm_core::{
    Abort, Addr, Algorithm, BackoffCm, BeginStatus, ContentionManager, Descriptor, Mode,
    StmGlobals, TxResult,
};

use super::{finish_ro, finish_rw};

const READ_TIMEOUT: u32 = 32;
const ACQUIRE_TIMEOUT: u32 = 128;
const DRAIN_TIMEOUT: u32 = 256;

pub struct BitEager {
    cm: BackoffCm,
}

impl BitEager {
    #[must_use]
    pub fn new() -> Self {
        Self { cm: BackoffCm }
    }
}

impl Default for BitEager {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for BitEager {
    fn name(&self) -> &'static str {
        "BitEager"
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
        let stripe = g.bitlocks.stripe_of(addr);
        let lock = g.bitlocks.entry(stripe);
        let me = d.slot_id as usize;

        if d.mode != Mode::ReadOnly && lock.owner() == d.id as usize {
            return Ok(g.heap.load(addr));
        }
        if lock.readers.get(me) {
            return Ok(g.heap.load(addr));
        }

        d.r_bitlocks.push(stripe);
        let mut tries = 0_u32;
        loop {
            lock.readers.set(me);
            if lock.owner() == 0 {
                return Ok(g.heap.load(addr));
            }

            lock.readers.unset(me);
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
        let stripe = g.bitlocks.stripe_of(addr);
        let lock = g.bitlocks.entry(stripe);
        let me = d.slot_id as usize;

        if lock.owner() == d.id as usize {
            d.undo_log.log(addr, g.heap.load(addr), mask);
            g.heap.store_masked(addr, value, mask);
            return Ok(());
        }

        let mut tries = 0_u32;
        while !lock.try_own(d.id as usize) {
            tries += 1;
            if tries > ACQUIRE_TIMEOUT {
                return Err(Abort::Timeout);
            }
            std::hint::spin_loop();
        }
        d.w_bitlocks.push(stripe);
        lock.readers.unset(me);

        tries = 0;
        while lock.readers.count_except(me) != 0 {
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
            for &stripe in &d.r_bitlocks {
                g.bitlocks.entry(stripe).readers.unset(me);
            }
            finish_ro(g, d);
            return Ok(());
        }

        for &stripe in &d.w_bitlocks {
            g.bitlocks.entry(stripe).release_owner();
        }
        for &stripe in &d.r_bitlocks {
            g.bitlocks.entry(stripe).readers.unset(me);
        }
        finish_rw(g, d);
        Ok(())
    }

    fn rollback(&self, g: &StmGlobals, d: &mut Descriptor) {
        let me = d.slot_id as usize;
        d.undo_log.undo(&g.heap);
        for &stripe in &d.w_bitlocks {
            g.bitlocks.entry(stripe).release_owner();
        }
        for &stripe in &d.r_bitlocks {
            g.bitlocks.entry(stripe).readers.unset(me);
        }
        d.reset_lists();
        d.mode = Mode::ReadOnly;
    }
}
