//! NOrec: a single global sequence lock with value-based validation.
//!
//! The global clock doubles as the sequence lock; its low bit is the
//! write-active flag. Readers log (address, value, mask) triples and
//! revalidate by re-reading whenever the lock moves; the committer takes
//! the lock with a compare-and-swap from its snapshot (obstruction-free:
//! a failed swap revalidates and retries rather than aborting), writes
//! back, and releases at snapshot + 2. At most one writer commits at a
//! time and reads always see a consistent snapshot.

use std::sync::atomic::{Ordering, fence};

use stripetm_core::{
    Abort, Addr, Algorithm, BackoffCm, BeginStatus, ContentionManager, Descriptor, Mode,
    StmGlobals, TxResult,
};

use super::{finish_ro, finish_rw, merge_raw, raw_lookup};

pub struct NOrec {
    cm: BackoffCm,
}

impl NOrec {
    #[must_use]
    pub fn new() -> Self {
        Self { cm: BackoffCm }
    }

    /// Wait for the sequence lock to settle even, then confirm every
    /// logged read still holds its observed value. Returns the even lock
    /// value the log was valid at.
    fn revalidate(g: &StmGlobals, d: &Descriptor) -> TxResult<u64> {
        loop {
            let s = g.timestamp.load(Ordering::SeqCst);
            if s & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            fence(Ordering::SeqCst);
            if !d.vlist.still_valid(&g.heap) {
                return Err(Abort::Conflict);
            }
            fence(Ordering::SeqCst);
            if g.timestamp.load(Ordering::SeqCst) == s {
                return Ok(s);
            }
        }
    }
}

impl Default for NOrec {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for NOrec {
    fn name(&self) -> &'static str {
        "NOrec"
    }

    fn privatization_safe(&self) -> bool {
        true
    }

    fn cm(&self) -> &dyn ContentionManager {
        &self.cm
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        // Round an odd lock down instead of spinning for even.
        d.start_time = g.timestamp.load(Ordering::SeqCst) & !1;
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        if d.mode != Mode::ReadOnly {
            if let Some(v) = raw_lookup(d, addr, mask) {
                return Ok(v);
            }
        }

        let mut val = g.heap.load(addr);
        while d.start_time != g.timestamp.load(Ordering::SeqCst) {
            d.start_time = Self::revalidate(g, d)?;
            val = g.heap.load(addr);
        }
        d.vlist.log(addr, val, mask);

        if d.mode != Mode::ReadOnly {
            val = merge_raw(d, addr, val, mask);
        }
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
        if d.mode == Mode::ReadOnly {
            d.mode = Mode::ReadWrite;
        }
        Ok(())
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        if d.mode == Mode::ReadOnly {
            finish_ro(g, d);
            return Ok(());
        }

        // Take the sequence lock from a valid snapshot.
        while g
            .timestamp
            .compare_exchange(
                d.start_time,
                d.start_time + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            d.start_time = Self::revalidate(g, d)?;
        }

        d.writes.writeback(&g.heap);
        fence(Ordering::SeqCst);
        g.timestamp.store(d.start_time + 2, Ordering::SeqCst);

        finish_rw(g, d);
        Ok(())
    }

    fn rollback(&self, _g: &StmGlobals, d: &mut Descriptor) {
        d.reset_lists();
        d.mode = Mode::ReadOnly;
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        // The clock is this algorithm's sequence lock; it must be even.
        let now = g.raise_clock_over_marks();
        if now & 1 == 1 {
            g.timestamp.store(now + 1, Ordering::SeqCst);
        }
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        d.start_time = Self::revalidate(g, d)?;
        Ok(())
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
    fn sequence_lock_bumps_by_two_per_writer() {
        let (g, mut d) = setup();
        let alg = NOrec::new();
        alg.on_switch_to(&g);
        let a = Addr(3);

        alg.begin(&g, &mut d).unwrap();
        assert_eq!(alg.read(&g, &mut d, a, MASK_FULL).unwrap(), 0);
        alg.write(&g, &mut d, a, 9, MASK_FULL).unwrap();
        // Read-after-write resolves from the redo log.
        assert_eq!(alg.read(&g, &mut d, a, MASK_FULL).unwrap(), 9);
        alg.commit(&g, &mut d).unwrap();

        assert_eq!(g.heap.load(a), 9);
        assert_eq!(g.now() % 2, 0);
        assert_eq!(g.now(), 2);
    }

    #[test]
    fn remote_write_fails_value_validation() {
        let (g, mut d) = setup();
        let alg = NOrec::new();
        alg.on_switch_to(&g);
        let a = Addr(5);

        alg.begin(&g, &mut d).unwrap();
        assert_eq!(alg.read(&g, &mut d, a, MASK_FULL).unwrap(), 0);

        // Another committer changes the value and the sequence lock.
        g.heap.store(a, 7);
        g.timestamp.store(2, std::sync::atomic::Ordering::SeqCst);

        alg.write(&g, &mut d, a, 1, MASK_FULL).unwrap();
        assert!(alg.commit(&g, &mut d).is_err());
        alg.rollback(&g, &mut d);
        assert_eq!(d.mode, Mode::ReadOnly);
        assert_eq!(g.heap.load(a), 7, "aborted writer published nothing");
    }

    #[test]
    fn read_only_commit_never_touches_the_lock() {
        let (g, mut d) = setup();
        let alg = NOrec::new();
        alg.on_switch_to(&g);

        alg.begin(&g, &mut d).unwrap();
        let _ = alg.read(&g, &mut d, Addr(1), MASK_FULL).unwrap();
        alg.commit(&g, &mut d).unwrap();
        assert_eq!(g.now(), 0);
    }
}
