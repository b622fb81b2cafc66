//! stripetm: a library of word-granularity software transactional memory
//! algorithms.
//!
//! One algorithm is installed per process (initially from `STM_CONFIG`,
//! default NOrec) and can be hot-swapped while transactions are in flight.
//! Threads bracket reads and writes of shared arena words in
//! [`atomically`] blocks; conflicting transactions retry transparently
//! from their checkpoint.
//!
//! ```no_run
//! use stripetm::{Config, atomically};
//!
//! stripetm::sys_init(&Config::default()).unwrap();
//! let v = stripetm::alloc_words(2).unwrap();
//! let total = atomically(|tx| {
//!     let a = tx.read(v)?;
//!     tx.write(v.offset(1), a + 1)?;
//!     Ok(a)
//! });
//! # let _ = total;
//! ```

pub mod algs;
pub mod config;
mod system;

use std::marker::PhantomData;

pub use config::Config;
pub use stripetm_core::{
    Abort, Addr, MASK_FULL, StatsReport, ThreadStatsSnapshot, TxResult, WordRange,
};
pub use stripetm_error::StripetmError;
pub use system::{StmSystem, fatal, sys_init, system, thread_init, thread_shutdown};

/// Execute `body` as a transaction, retrying transparently on conflict.
///
/// Unrecoverable failures (transactional heap exhaustion under plain
/// `atomically`) terminate the process; use [`try_atomically`] to surface
/// them instead.
pub fn atomically<T>(mut body: impl FnMut(&mut Txn) -> TxResult<T>) -> T {
    match system::run_txn(&mut body) {
        Ok(v) => v,
        Err(e) => system::fatal(&format!("transaction could not complete: {e}")),
    }
}

/// Execute `body` as a transaction; conflicts retry, unrecoverable
/// failures return an error after rollback.
pub fn try_atomically<T>(
    mut body: impl FnMut(&mut Txn) -> TxResult<T>,
) -> Result<T, StripetmError> {
    system::run_txn(&mut body)
}

/// Swap the installed algorithm while transactions may be in flight.
pub fn install_algorithm(name: &str) -> Result<(), StripetmError> {
    let sys = system()?;
    let index = sys.table.index_of(name)?;
    stripetm_core::install_algorithm(&sys.globals, &sys.table, index);
    Ok(())
}

/// Name of the installed algorithm.
pub fn current_algorithm() -> Result<&'static str, StripetmError> {
    let sys = system()?;
    Ok(sys.table.get(sys.globals.switch.current()).name())
}

/// Whether the installed algorithm advertises privatization safety.
pub fn privatization_safe() -> Result<bool, StripetmError> {
    let sys = system()?;
    Ok(sys
        .table
        .get(sys.globals.switch.current())
        .privatization_safe())
}

/// Emit the per-thread statistics report and return it.
pub fn sys_shutdown() -> Result<StatsReport, StripetmError> {
    let sys = system()?;
    let name = sys.table.get(sys.globals.switch.current()).name();
    let report = StatsReport::gather(&sys.globals.registry, name);
    tracing::info!(
        target: "stripetm.stats",
        report = %serde_json::to_string(&report).unwrap_or_default(),
        "shutdown report"
    );
    if sys.stats_on_shutdown {
        println!("{report}");
    }
    Ok(report)
}

/// Allocate `len` arena words outside any transaction (setup,
/// privatized structures).
pub fn alloc_words(len: u32) -> Result<Addr, StripetmError> {
    system()?.globals.heap.alloc(len)
}

/// Non-transactional read of an arena word.
pub fn peek(addr: Addr) -> Result<u64, StripetmError> {
    Ok(system()?.globals.heap.load(addr))
}

/// Non-transactional write of an arena word.
pub fn poke(addr: Addr, value: u64) -> Result<(), StripetmError> {
    system()?.globals.heap.store(addr, value);
    Ok(())
}

/// Proof that the caller is inside a transaction; every transactional
/// operation hangs off it. Not `Send`: a transaction belongs to the thread
/// that began it.
pub struct Txn {
    _not_send: PhantomData<*mut ()>,
}

impl Txn {
    pub(crate) fn token() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }

    /// Transactional read of a whole word.
    pub fn read(&mut self, addr: Addr) -> TxResult<u64> {
        self.read_masked(addr, MASK_FULL)
    }

    /// Transactional read of the byte lanes selected by `mask`.
    pub fn read_masked(&mut self, addr: Addr, mask: u64) -> TxResult<u64> {
        system::in_txn(|sys, d| {
            sys.table
                .get(d.alg_cache)
                .read(&sys.globals, d, addr, mask)
        })
    }

    /// Transactional write of a whole word.
    pub fn write(&mut self, addr: Addr, value: u64) -> TxResult<()> {
        self.write_masked(addr, value, MASK_FULL)
    }

    /// Transactional write of the byte lanes selected by `mask`. A mask of
    /// zero writes nothing but stays visible to this transaction's own
    /// reads.
    pub fn write_masked(&mut self, addr: Addr, value: u64, mask: u64) -> TxResult<()> {
        system::in_txn(|sys, d| {
            sys.table
                .get(d.alg_cache)
                .write(&sys.globals, d, addr, value, mask)
        })
    }

    /// Allocate words inside the transaction; unwound if it aborts.
    pub fn alloc(&mut self, len: u32) -> TxResult<Addr> {
        system::in_txn(|sys, d| d.alloc.alloc(&sys.globals.heap, len))
    }

    /// Free a range inside the transaction; takes effect only on commit,
    /// and the words are recycled only after every concurrent transaction
    /// has moved past this epoch.
    pub fn free(&mut self, range: WordRange) {
        system::in_txn(|_, d| d.alloc.free(range));
    }

    /// Abort and re-execute from the checkpoint.
    pub fn restart<T>(&mut self) -> TxResult<T> {
        Err(Abort::Explicit)
    }

    /// Run the installed algorithm's validator right now (the sandboxing
    /// hook): an inconsistent snapshot aborts.
    pub fn validate_now(&mut self) -> TxResult<()> {
        system::in_txn(|sys, d| sys.table.get(d.alg_cache).validate(&sys.globals, d))
    }

    /// A flat nested scope: adjusts the depth counter only; an abort
    /// inside unwinds to the outer checkpoint.
    pub fn subsume<T>(&mut self, f: impl FnOnce(&mut Txn) -> TxResult<T>) -> TxResult<T> {
        system::in_txn(|_, d| d.nesting_depth += 1);
        let mut inner = Txn::token();
        let result = f(&mut inner);
        system::in_txn(|_, d| d.nesting_depth -= 1);
        result
    }

    /// Escalate to irrevocable execution. No bundled algorithm supports
    /// in-flight escalation, so this terminates the process with a
    /// diagnostic, per the library's unsupported-escalation contract.
    pub fn become_irrevocable(&mut self) {
        let supported = system::in_txn(|sys, d| {
            let alg = sys.table.get(d.alg_cache);
            (alg.irrevoc(&sys.globals, d), alg.name())
        });
        if !supported.0 {
            system::fatal(&format!(
                "algorithm '{}' cannot become irrevocable in flight",
                supported.1
            ));
        }
    }
}
