//! The algorithm dispatch contract, the registration table, and the
//! installation (hot-swap) protocol.
//!
//! Each algorithm is one object implementing [`Algorithm`]; barriers
//! dispatch through the table entry the switch controller currently
//! names, combined with the descriptor's mode tag. Installation drains
//! every in-flight transaction behind the begin gate, lets the incoming
//! algorithm normalize the shared planes, then publishes the new entry.

use stripetm_error::StripetmError;

use crate::checkpoint::{BeginStatus, TxResult};
use crate::descriptor::Descriptor;
use crate::global::StmGlobals;
use crate::heap::Addr;
use crate::sync::spin_hint;

/// Contention-manager capability. An algorithm picks one at registration
/// time; the retry loop invokes the hooks at the matching lifecycle
/// points.
pub trait ContentionManager: Send + Sync {
    /// Outer begin, after the begin gate.
    fn on_begin(&self, _d: &mut Descriptor) {}
    /// After rollback, before the retry re-enters begin.
    fn on_abort(&self, _d: &mut Descriptor) {}
    /// After a successful outer commit.
    fn on_commit(&self, _d: &mut Descriptor) {}
}

/// No reaction to contention.
pub struct NoopCm;

impl ContentionManager for NoopCm {}

/// Randomized exponential backoff scaled by the consecutive-abort count.
pub struct BackoffCm;

impl ContentionManager for BackoffCm {
    fn on_abort(&self, d: &mut Descriptor) {
        let n = d.consec_aborts;
        d.backoff.pause(n);
    }
}

/// The concurrency-control contract every algorithm implements.
///
/// `read`/`write`/`commit` consult the descriptor's mode tag for the
/// read-only / read-write / turbo variant. `rollback` must leave the
/// descriptor ready for the retry (including deciding the retry's mode)
/// and must never fail. `validate` backs the sandbox "validate-now" hook.
pub trait Algorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether privatized data is safe to access non-transactionally the
    /// moment it becomes unreachable.
    fn privatization_safe(&self) -> bool;

    /// The contention manager chosen at registration.
    fn cm(&self) -> &dyn ContentionManager {
        &NoopCm
    }

    fn begin(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<BeginStatus>;

    fn read(&self, g: &StmGlobals, d: &mut Descriptor, addr: Addr, mask: u64) -> TxResult<u64>;

    fn write(
        &self,
        g: &StmGlobals,
        d: &mut Descriptor,
        addr: Addr,
        value: u64,
        mask: u64,
    ) -> TxResult<()>;

    fn commit(&self, g: &StmGlobals, d: &mut Descriptor) -> TxResult<()>;

    fn rollback(&self, g: &StmGlobals, d: &mut Descriptor);

    /// Attempt in-flight irrevocability. Default: not supported.
    fn irrevoc(&self, _g: &StmGlobals, _d: &mut Descriptor) -> bool {
        false
    }

    /// Normalize shared planes for this algorithm. Runs under the begin
    /// gate with all transactions drained.
    fn on_switch_to(&self, _g: &StmGlobals) {}

    /// Re-check the transaction's reads right now (sandbox hook).
    fn validate(&self, _g: &StmGlobals, _d: &mut Descriptor) -> TxResult<()> {
        Ok(())
    }
}

/// The registration table. Built once at system init, read-only after.
pub struct AlgorithmTable {
    algs: Vec<Box<dyn Algorithm>>,
}

impl AlgorithmTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self { algs: Vec::new() }
    }

    /// Register an algorithm; index order is registration order.
    pub fn register(&mut self, alg: Box<dyn Algorithm>) -> usize {
        tracing::debug!(target: "stripetm.switch", name = alg.name(), "algorithm registered");
        self.algs.push(alg);
        self.algs.len() - 1
    }

    /// The entry at `index`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> &dyn Algorithm {
        self.algs[index].as_ref()
    }

    /// Look up an algorithm by its registered name.
    pub fn index_of(&self, name: &str) -> Result<usize, StripetmError> {
        self.algs
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| StripetmError::UnknownAlgorithm { name: name.into() })
    }

    /// Registered names, in index order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.algs.iter().map(|a| a.name())
    }

    /// Number of registered algorithms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.algs.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.algs.is_empty()
    }
}

impl Default for AlgorithmTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the algorithm at `new_index` while transactions may be in
/// flight.
///
/// Raises the begin gate (one switcher at a time), drains every in-flight
/// transaction (wait loops self-abort when they see the gate), runs the
/// incoming on-switch hook against normalized planes, then publishes and
/// drops the gate.
pub fn install_algorithm(g: &StmGlobals, table: &AlgorithmTable, new_index: usize) {
    let new_alg = table.get(new_index);
    let old_name = table.get(g.switch.current()).name();
    g.switch.lock_gate();
    let drain_start = crate::sync::tick_ns();

    // Quiescence: every thread that was inside a transaction either
    // commits or self-aborts out of its wait loop.
    for (_, slot) in g.registry.iter() {
        while slot.in_tx.load(std::sync::atomic::Ordering::SeqCst) {
            spin_hint();
        }
    }
    let drain_ns = crate::sync::tick_ns() - drain_start;

    if !new_alg.privatization_safe() {
        tracing::warn!(
            target: "stripetm.switch",
            algorithm = new_alg.name(),
            "installing an algorithm that is not privatization-safe"
        );
    }

    g.raise_clock_over_marks();
    g.reset_slots_and_cohort_planes();
    new_alg.on_switch_to(g);

    g.switch.publish(new_index);
    g.switch.unlock_gate();
    tracing::info!(
        target: "stripetm.switch",
        from = old_name,
        to = new_alg.name(),
        generation = g.switch.generation(),
        drain_ns,
        "algorithm installed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::GlobalsConfig;

    struct Dummy(&'static str);

    impl Algorithm for Dummy {
        fn name(&self) -> &'static str {
            self.0
        }
        fn privatization_safe(&self) -> bool {
            true
        }
        fn begin(&self, _g: &StmGlobals, _d: &mut Descriptor) -> TxResult<BeginStatus> {
            Ok(BeginStatus::Instrumented)
        }
        fn read(
            &self,
            g: &StmGlobals,
            _d: &mut Descriptor,
            addr: Addr,
            _mask: u64,
        ) -> TxResult<u64> {
            Ok(g.heap.load(addr))
        }
        fn write(
            &self,
            g: &StmGlobals,
            _d: &mut Descriptor,
            addr: Addr,
            value: u64,
            mask: u64,
        ) -> TxResult<()> {
            g.heap.store_masked(addr, value, mask);
            Ok(())
        }
        fn commit(&self, _g: &StmGlobals, _d: &mut Descriptor) -> TxResult<()> {
            Ok(())
        }
        fn rollback(&self, _g: &StmGlobals, _d: &mut Descriptor) {}
        fn on_switch_to(&self, g: &StmGlobals) {
            let now = g.raise_clock_over_marks();
            g.last_complete
                .store(now, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn table_lookup_by_name() {
        let mut t = AlgorithmTable::new();
        let a = t.register(Box::new(Dummy("A")));
        let b = t.register(Box::new(Dummy("B")));
        assert_eq!(t.index_of("A").unwrap(), a);
        assert_eq!(t.index_of("B").unwrap(), b);
        assert!(matches!(
            t.index_of("C"),
            Err(StripetmError::UnknownAlgorithm { .. })
        ));
        assert_eq!(t.names().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn install_publishes_and_normalizes() {
        let g = StmGlobals::new(GlobalsConfig {
            heap_words: 64,
            n_stripes: 64,
        });
        let mut t = AlgorithmTable::new();
        t.register(Box::new(Dummy("A")));
        let b = t.register(Box::new(Dummy("B")));

        g.timestamp_max.store(41, std::sync::atomic::Ordering::SeqCst);
        let gen = g.switch.generation();
        install_algorithm(&g, &t, b);
        assert_eq!(g.switch.current(), b);
        assert_eq!(g.switch.generation(), gen + 1);
        assert!(!g.switch.blocked());
        // The incoming hook saw the raised clock.
        assert_eq!(g.now(), 41);
        assert_eq!(g.last_complete.load(std::sync::atomic::Ordering::SeqCst), 41);
    }
}
