//! OrecEager: encounter-time locking, direct update, undo log.
//!
//! Writes acquire the covering orec immediately and mutate memory in
//! place; aborts replay the undo log in reverse and release each orec at
//! prior-version + 1, bumping the global clock if that exceeds it so an
//! unlocked orec never outruns the clock. Reads sandwich the data load
//! between two orec loads and extend the snapshot on too-new versions.

use std::sync::atomic::Ordering;

use stripetm_core::{
    Abort, Addr, Algorithm, BackoffCm, BeginStatus, ContentionManager, Descriptor, Mode,
    StmGlobals, TxResult, is_owned,
};

use super::{extend_snapshot, finish_ro, finish_rw, release_locks_at, validate_owned};

pub struct OrecEager {
    cm: BackoffCm,
}

impl OrecEager {
    #[must_use]
    pub fn new() -> Self {
        Self { cm: BackoffCm }
    }
}

impl Default for OrecEager {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for OrecEager {
    fn name(&self) -> &'static str {
        "OrecEager"
    }

    fn privatization_safe(&self) -> bool {
        false
    }

    fn cm(&self) -> &dyn ContentionManager {
        &self.cm
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        d.start_time = g.now();
        Ok(BeginStatus::Instrumented)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, _mask: u64) -> TxResult<u64> {
        let stripe = g.orecs.stripe_of(addr);
        let entry = g.orecs.entry(stripe);
        loop {
            let ivt = entry.load();
            let val = g.heap.load(addr);

            // Own lock: the in-place value is ours.
            if ivt == d.my_lock {
                return Ok(val);
            }

            let ivt2 = entry.load();
            if ivt == ivt2 && ivt <= d.start_time {
                d.r_orecs.push(stripe);
                return Ok(val);
            }

            if is_owned(ivt) {
                return Err(Abort::Conflict);
            }

            extend_snapshot(g, d)?;
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
        let stripe = g.orecs.stripe_of(addr);
        let entry = g.orecs.entry(stripe);
        loop {
            let ivt = entry.load();

            if ivt <= d.start_time {
                if !entry.try_acquire(ivt, d.my_lock) {
                    return Err(Abort::Conflict);
                }
                d.locks.push(stripe);
                d.undo_log.log(addr, g.heap.load(addr), mask);
                g.heap.store_masked(addr, value, mask);
                if d.mode == Mode::ReadOnly {
                    d.mode = Mode::ReadWrite;
                }
                return Ok(());
            }

            // Holding the stripe does not mean this address is undo-logged
            // yet; many addresses share an orec.
            if ivt == d.my_lock {
                d.undo_log.log(addr, g.heap.load(addr), mask);
                g.heap.store_masked(addr, value, mask);
                return Ok(());
            }

            if is_owned(ivt) {
                return Err(Abort::Conflict);
            }

            extend_snapshot(g, d)?;
        }
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        if d.locks.is_empty() {
            finish_ro(g, d);
            return Ok(());
        }

        let end_time = g.advance_clock();

        // Nobody else committed since the snapshot: the read set cannot
        // have changed.
        if end_time != d.start_time + 1 {
            validate_owned(g, d)?;
        }

        release_locks_at(g, d, end_time);
        finish_rw(g, d);
        Ok(())
    }

    fn rollback(&self, g: &StmGlobals, d: &mut Descriptor) {
        d.undo_log.undo(&g.heap);

        // Release at prior + 1 so readers that raced the undo revalidate;
        // keep the clock at or above every released version.
        let mut max = 0_u64;
        for &stripe in &d.locks {
            let e = g.orecs.entry(stripe);
            let newver = e.prev() + 1;
            e.set_version(newver);
            max = max.max(newver);
        }
        let ts = g.now();
        if max > ts {
            let _ = g.timestamp.compare_exchange(ts, ts + 1, Ordering::SeqCst, Ordering::SeqCst);
        }

        d.reset_lists();
        d.mode = Mode::ReadOnly;
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        g.raise_clock_over_marks();
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        validate_owned(g, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripetm_core::{Addr, GlobalsConfig, MASK_FULL, owner_word};

    fn setup() -> (StmGlobals, Descriptor) {
        let g = StmGlobals::new(GlobalsConfig {
            heap_words: 256,
            n_stripes: 64,
        });
        let slot = g.registry.claim().expect("slot");
        (g, Descriptor::new(slot))
    }

    #[test]
    fn write_locks_and_commit_publishes_the_clock() {
        let (g, mut d) = setup();
        let alg = OrecEager::new();
        alg.on_switch_to(&g);
        let a = Addr(9);

        alg.begin(&g, &mut d).unwrap();
        alg.write(&g, &mut d, a, 4, MASK_FULL).unwrap();
        // The covering orec is owned in place.
        assert_eq!(g.orecs.entry_for(a).load(), d.my_lock);
        assert_eq!(g.heap.load(a), 4, "eager update is in place");
        // Own reads see the in-place value.
        assert_eq!(alg.read(&g, &mut d, a, MASK_FULL).unwrap(), 4);
        alg.commit(&g, &mut d).unwrap();

        let version = g.orecs.entry_for(a).load();
        assert!(!stripetm_core::is_owned(version));
        assert!(version <= g.now());
        assert_eq!(g.heap.load(a), 4);
    }

    #[test]
    fn rollback_undoes_and_never_reexposes_old_versions() {
        let (g, mut d) = setup();
        let alg = OrecEager::new();
        alg.on_switch_to(&g);
        let a = Addr(2);
        g.heap.store(a, 11);

        alg.begin(&g, &mut d).unwrap();
        let observed = g.orecs.entry_for(a).load();
        alg.write(&g, &mut d, a, 99, MASK_FULL).unwrap();
        alg.rollback(&g, &mut d);

        assert_eq!(g.heap.load(a), 11, "undo restored the prior value");
        let released = g.orecs.entry_for(a).load();
        assert!(released >= observed + 1, "released version moved forward");
        assert!(released <= g.now(), "clock covers the released version");
    }

    #[test]
    fn foreign_lock_aborts_the_reader() {
        let (g, mut d) = setup();
        let alg = OrecEager::new();
        alg.on_switch_to(&g);
        let a = Addr(7);
        // Another thread owns the stripe.
        g.orecs.entry_for(a).set_version(owner_word(42));

        alg.begin(&g, &mut d).unwrap();
        assert!(alg.read(&g, &mut d, a, MASK_FULL).is_err());
        alg.rollback(&g, &mut d);
    }

    #[test]
    fn too_new_version_extends_the_snapshot() {
        let (g, mut d) = setup();
        let alg = OrecEager::new();
        alg.on_switch_to(&g);
        let a = Addr(4);

        alg.begin(&g, &mut d).unwrap();
        // A commit lands after our snapshot but before our first read.
        g.timestamp.store(5, std::sync::atomic::Ordering::SeqCst);
        g.orecs.entry_for(a).set_version(5);
        g.heap.store(a, 1);

        assert_eq!(alg.read(&g, &mut d, a, MASK_FULL).unwrap(), 1);
        assert_eq!(d.start_time, 5, "snapshot scaled forward");
        alg.commit(&g, &mut d).unwrap();
    }
}
