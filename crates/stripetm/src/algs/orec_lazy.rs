//! The lazy-acquire orec algorithms: OrecLazy and LLT.
//!
//! Both buffer writes and take every covering orec only at commit, then
//! validate, write back, and release at a fresh clock value. They differ
//! in the read barrier: OrecLazy extends its snapshot when it meets a
//! version newer than its start time; LLT aborts outright, trading retry
//! rate for a shorter read path.

use stripetm_core::{
    Abort, Addr, Algorithm, BackoffCm, BeginStatus, ContentionManager, Descriptor, Mode,
    StmGlobals, TxResult, is_owned,
};

use super::{
    acquire_write_orecs, extend_snapshot, finish_ro, finish_rw, merge_raw, raw_lookup,
    release_locks_at, release_locks_to_prev, validate_owned,
};

fn lazy_begin(g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
    d.start_time = g.now();
    Ok(BeginStatus::Instrumented)
}

fn lazy_write(d: &mut Descriptor, addr: Addr, value: u64, mask: u64) -> TxResult<()> {
    d.writes.insert(addr, value, mask);
    if d.mode == Mode::ReadOnly {
        d.mode = Mode::ReadWrite;
    }
    Ok(())
}

fn lazy_commit(g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
    if d.mode == Mode::ReadOnly {
        finish_ro(g, d);
        return Ok(());
    }

    acquire_write_orecs(g, d)?;
    let end_time = g.advance_clock();
    if end_time != d.start_time + 1 {
        validate_owned(g, d)?;
    }
    d.writes.writeback(&g.heap);
    release_locks_at(g, d, end_time);

    finish_rw(g, d);
    Ok(())
}

fn lazy_rollback(g: &StmGlobals, d: &mut Descriptor) {
    release_locks_to_prev(g, d);
    d.reset_lists();
    d.mode = Mode::ReadOnly;
}

pub struct OrecLazy {
    cm: BackoffCm,
}

impl OrecLazy {
    #[must_use]
    pub fn new() -> Self {
        Self { cm: BackoffCm }
    }
}

impl Default for OrecLazy {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for OrecLazy {
    fn name(&self) -> &'static str {
        "OrecLazy"
    }

    fn privatization_safe(&self) -> bool {
        false
    }

    fn cm(&self) -> &dyn ContentionManager {
        &self.cm
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        lazy_begin(g, d)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        if d.mode != Mode::ReadOnly {
            if let Some(v) = raw_lookup(d, addr, mask) {
                return Ok(v);
            }
        }
        let stripe = g.orecs.stripe_of(addr);
        let entry = g.orecs.entry(stripe);
        loop {
            let ivt = entry.load();
            let val = g.heap.load(addr);
            let ivt2 = entry.load();

            if ivt == ivt2 && ivt <= d.start_time {
                d.r_orecs.push(stripe);
                let val = if d.mode != Mode::ReadOnly {
                    merge_raw(d, addr, val, mask)
                } else {
                    val
                };
                return Ok(val);
            }

            if is_owned(ivt) || is_owned(ivt2) {
                return Err(Abort::Conflict);
            }

            extend_snapshot(g, d)?;
        }
    }

    fn write(
        &self,
        _g: &StmGlobals,
        d: &mut Descriptor,
        addr: Addr,
        value: u64,
        mask: u64,
    ) -> TxResult<()> {
        lazy_write(d, addr, value, mask)
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        lazy_commit(g, d)
    }

    fn rollback(&self, g: &StmGlobals, d: &mut Descriptor) {
        lazy_rollback(g, d);
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
    fn writes_stay_buffered_until_commit() {
        let (g, mut d) = setup();
        let alg = OrecLazy::new();
        alg.on_switch_to(&g);
        let a = Addr(6);

        alg.begin(&g, &mut d).unwrap();
        alg.write(&g, &mut d, a, 21, MASK_FULL).unwrap();
        assert_eq!(g.heap.load(a), 0, "nothing published before commit");
        assert!(!stripetm_core::is_owned(g.orecs.entry_for(a).load()));
        assert_eq!(alg.read(&g, &mut d, a, MASK_FULL).unwrap(), 21);

        alg.commit(&g, &mut d).unwrap();
        assert_eq!(g.heap.load(a), 21);
        assert_eq!(g.orecs.entry_for(a).load(), g.now());
    }

    #[test]
    fn commit_aborts_on_stolen_write_orec() {
        let (g, mut d) = setup();
        let alg = OrecLazy::new();
        alg.on_switch_to(&g);
        let a = Addr(8);

        alg.begin(&g, &mut d).unwrap();
        alg.write(&g, &mut d, a, 1, MASK_FULL).unwrap();
        // A competitor publishes a newer version before our acquisition.
        let end = g.advance_clock();
        g.orecs.entry_for(a).set_version(end);

        assert!(alg.commit(&g, &mut d).is_err());
        alg.rollback(&g, &mut d);
        assert_eq!(g.heap.load(a), 0);
    }

    #[test]
    fn llt_read_aborts_instead_of_extending() {
        let (g, mut d) = setup();
        let alg = Llt::new();
        alg.on_switch_to(&g);
        let a = Addr(3);

        alg.begin(&g, &mut d).unwrap();
        g.timestamp.store(4, std::sync::atomic::Ordering::SeqCst);
        g.orecs.entry_for(a).set_version(4);

        assert!(alg.read(&g, &mut d, a, MASK_FULL).is_err());
        alg.rollback(&g, &mut d);
    }
}

/// LLT: lazy acquire with check-twice reads and no snapshot extension.
pub struct Llt {
    cm: BackoffCm,
}

impl Llt {
    #[must_use]
    pub fn new() -> Self {
        Self { cm: BackoffCm }
    }
}

impl Default for Llt {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for Llt {
    fn name(&self) -> &'static str {
        "LLT"
    }

    fn privatization_safe(&self) -> bool {
        false
    }

    fn cm(&self) -> &dyn ContentionManager {
        &self.cm
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus> {
        lazy_begin(g, d)
    }

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64> {
        if d.mode != Mode::ReadOnly {
            if let Some(v) = raw_lookup(d, addr, mask) {
                return Ok(v);
            }
        }
        let stripe = g.orecs.stripe_of(addr);
        let entry = g.orecs.entry(stripe);

        let ivt = entry.load();
        let val = g.heap.load(addr);
        let ivt2 = entry.load();

        if ivt <= d.start_time && ivt == ivt2 {
            d.r_orecs.push(stripe);
            let val = if d.mode != Mode::ReadOnly {
                merge_raw(d, addr, val, mask)
            } else {
                val
            };
            return Ok(val);
        }
        Err(Abort::Conflict)
    }

    fn write(
        &self,
        _g: &StmGlobals,
        d: &mut Descriptor,
        addr: Addr,
        value: u64,
        mask: u64,
    ) -> TxResult<()> {
        lazy_write(d, addr, value, mask)
    }

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        lazy_commit(g, d)
    }

    fn rollback(&self, g: &StmGlobals, d: &mut Descriptor) {
        lazy_rollback(g, d);
    }

    fn on_switch_to(&self, g: &StmGlobals) {
        g.raise_clock_over_marks();
    }

    fn validate(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()> {
        validate_owned(g, d)
    }
}
