//! The process-wide system singleton, the thread-local descriptor, and the
//! transaction driver.
//!
//! The driver owns the retry loop that replaces a checkpoint-restoring
//! runtime: `begin` publishes the in-tx flag behind the switch gate, the
//! body runs with short-lived descriptor borrows per barrier, and an abort
//! rolls back, rewinds the checkpoint, and re-enters begin.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::OnceLock;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use stripetm_core::{
    Abort, AlgorithmTable, BeginStatus, Descriptor, GlobalsConfig, Mode, StmGlobals, TxResult,
    install_algorithm, spin_briefly, spin_hint,
};
use stripetm_error::StripetmError;

use crate::Txn;
use crate::config::Config;

/// Everything the process shares: the planes and the dispatch table.
pub struct StmSystem {
    pub globals: StmGlobals,
    pub table: AlgorithmTable,
    pub stats_on_shutdown: bool,
}

static SYSTEM: OnceLock<StmSystem> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialise the library: build the shared planes, register every
/// algorithm, and install the configured one. Idempotent; a second call
/// with a different configuration is ignored with a warning.
pub fn sys_init(config: &Config) -> Result<&'static StmSystem, StripetmError> {
    let _guard = INIT_LOCK.lock();
    if let Some(sys) = SYSTEM.get() {
        let current = sys.table.get(sys.globals.switch.current()).name();
        if current != config.algorithm {
            tracing::warn!(
                target: "stripetm.config",
                requested = config.algorithm.as_str(),
                installed = current,
                "sys_init called again; keeping the installed algorithm"
            );
        }
        return Ok(sys);
    }

    let mut table = AlgorithmTable::new();
    crate::algs::register_all(&mut table);
    let initial = table.index_of(&config.algorithm)?;

    let globals = StmGlobals::new(GlobalsConfig {
        heap_words: config.heap_words,
        n_stripes: config.n_stripes,
    });
    globals
        .seal_thresholds
        .reads
        .store(config.seal_reads, Ordering::SeqCst);
    globals
        .seal_thresholds
        .writes
        .store(config.seal_writes, Ordering::SeqCst);
    globals
        .seal_thresholds
        .aborts
        .store(config.seal_aborts, Ordering::SeqCst);

    let sys = SYSTEM.get_or_init(|| StmSystem {
        globals,
        table,
        stats_on_shutdown: config.stats_on_shutdown,
    });
    install_algorithm(&sys.globals, &sys.table, initial);
    tracing::info!(
        target: "stripetm.config",
        algorithm = config.algorithm.as_str(),
        heap_words = config.heap_words,
        "stripetm initialised"
    );
    Ok(sys)
}

/// The initialised system.
pub fn system() -> Result<&'static StmSystem, StripetmError> {
    SYSTEM.get().ok_or(StripetmError::NotInitialised)
}

// ---------------------------------------------------------------------------
// Thread-local descriptor
// ---------------------------------------------------------------------------

struct ThreadSlot {
    desc: Descriptor,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        if let Some(sys) = SYSTEM.get() {
            self.desc
                .alloc
                .on_thread_exit(&sys.globals.heap, &sys.globals.registry);
            sys.globals.registry.release(self.desc.slot_id);
        }
    }
}

thread_local! {
    static DESC: RefCell<Option<ThreadSlot>> = const { RefCell::new(None) };
}

/// Register the calling thread, claiming a descriptor slot. Implied by the
/// first transaction; explicit registration surfaces slot exhaustion
/// early.
pub fn thread_init() -> Result<(), StripetmError> {
    with_desc(|_, _| ())
}

/// Release the calling thread's slot. Also happens automatically at thread
/// exit.
pub fn thread_shutdown() {
    DESC.with(|cell| {
        cell.borrow_mut().take();
    });
}

/// Run `f` with the system and the calling thread's descriptor, claiming a
/// slot on first use. The borrow lasts only for `f`; the driver never
/// holds it across user code.
pub(crate) fn with_desc<R>(
    f: impl FnOnce(&'static StmSystem, &mut Descriptor) -> R,
) -> Result<R, StripetmError> {
    let sys = system()?;
    DESC.with(|cell| {
        let mut borrow = cell.borrow_mut();
        if borrow.is_none() {
            // Serialize slot claims against algorithm switches.
            sys.globals.switch.lock_gate();
            let claimed = sys.globals.registry.claim();
            sys.globals.switch.unlock_gate();
            let slot_id = claimed?;
            tracing::debug!(target: "stripetm.registry", slot = slot_id, "thread registered");
            *borrow = Some(ThreadSlot {
                desc: Descriptor::new(slot_id),
            });
        }
        let slot = borrow.as_mut().unwrap_or_else(|| unreachable!());
        Ok(f(sys, &mut slot.desc))
    })
}

/// Like [`with_desc`], for call sites that are only reachable from inside a
/// live transaction (barriers). Outside one, this is a usage error the
/// process cannot recover from.
pub(crate) fn in_txn<R>(f: impl FnOnce(&'static StmSystem, &mut Descriptor) -> R) -> R {
    match with_desc(f) {
        Ok(r) => r,
        Err(e) => fatal(&format!("transactional barrier outside a transaction: {e}")),
    }
}

/// Diagnostic process termination for unrecoverable conditions.
pub fn fatal(msg: &str) -> ! {
    tracing::error!(target: "stripetm", "fatal: {msg}");
    eprintln!("stripetm fatal: {msg}");
    std::process::abort();
}

// ---------------------------------------------------------------------------
// Abort unwinding across nested scopes
// ---------------------------------------------------------------------------

/// Private unwind payload carrying an abort out of a subsumed scope that
/// cannot return `Err` itself.
struct AbortSignal(Abort);

pub(crate) fn abort_unwind(a: Abort) -> ! {
    resume_unwind(Box::new(AbortSignal(a)))
}

enum BodyOutcome<T> {
    Done(TxResult<T>),
    /// A non-abort panic escaped the body; it must propagate after the
    /// transaction is unwound.
    Panicked(Box<dyn std::any::Any + Send>),
}

fn catch_abort<T>(body: &mut dyn FnMut(&mut Txn) -> TxResult<T>) -> BodyOutcome<T> {
    let mut txn = Txn::token();
    match catch_unwind(AssertUnwindSafe(|| body(&mut txn))) {
        Ok(r) => BodyOutcome::Done(r),
        Err(payload) => match payload.downcast::<AbortSignal>() {
            Ok(sig) => BodyOutcome::Done(Err(sig.0)),
            Err(other) => BodyOutcome::Panicked(other),
        },
    }
}

// ---------------------------------------------------------------------------
// The transaction driver
// ---------------------------------------------------------------------------

/// Execute `body` transactionally, retrying on any retryable abort.
pub(crate) fn run_txn<T>(
    body: &mut dyn FnMut(&mut Txn) -> TxResult<T>,
) -> Result<T, StripetmError> {
    if with_desc(|_, d| d.nesting_depth > 0)? {
        return run_subsumed(body);
    }

    with_desc(|_, d| d.checkpoint.arm())?;
    loop {
        begin_outer()?;
        let outcome = match catch_abort(body) {
            BodyOutcome::Done(r) => r,
            BodyOutcome::Panicked(payload) => {
                // Unwind the transaction so the panic cannot strand locks
                // or wedge the switch protocol, then let it travel.
                let _ = abort_outer(Abort::Explicit);
                resume_unwind(payload);
            }
        };
        let outcome: Result<T, Abort> = match outcome {
            Ok(value) => match commit_outer() {
                Ok(()) => return Ok(value),
                Err(abort) => Err(abort),
            },
            Err(abort) => Err(abort),
        };
        if let Err(abort) = outcome {
            abort_outer(abort)?;
        }
    }
}

/// Flat nesting: an inner transactional scope only adjusts the depth
/// counter. An inner abort unwinds to the outer driver loop.
fn run_subsumed<T>(body: &mut dyn FnMut(&mut Txn) -> TxResult<T>) -> Result<T, StripetmError> {
    with_desc(|_, d| d.nesting_depth += 1)?;
    let result = catch_abort(body);
    with_desc(|_, d| d.nesting_depth -= 1)?;
    match result {
        BodyOutcome::Done(Ok(v)) => Ok(v),
        BodyOutcome::Done(Err(abort)) => abort_unwind(abort),
        // Re-raise; the outer scope's handler owns the rollback.
        BodyOutcome::Panicked(payload) => resume_unwind(payload),
    }
}

fn begin_outer() -> Result<BeginStatus, StripetmError> {
    with_desc(|sys, d| {
        let g = &sys.globals;
        let slot = g.registry.slot(d.slot_id);
        d.nesting_depth = 1;
        loop {
            while g.switch.blocked() {
                spin_hint();
            }
            // Publish in-tx, then re-check the gate; a switcher that won
            // the race sees either the flag or our back-out.
            slot.in_tx.store(true, Ordering::SeqCst);
            if g.switch.blocked() {
                slot.in_tx.store(false, Ordering::SeqCst);
                continue;
            }
            let generation = g.switch.generation();
            if d.gen_cache != generation {
                // A swap invalidated whatever retry mode the old
                // algorithm's rollback chose.
                d.mode = Mode::ReadOnly;
            }
            d.gen_cache = generation;
            d.alg_cache = g.switch.current();
            d.alloc.on_tx_begin(slot);
            let alg = sys.table.get(d.alg_cache);
            alg.cm().on_begin(d);
            match alg.begin(g, d) {
                Ok(status) => return status,
                Err(_) => {
                    // Gate raced or cohort sealed while joining; not an
                    // abort of a running transaction.
                    d.alloc.on_tx_abort(&g.heap, slot);
                    slot.in_tx.store(false, Ordering::SeqCst);
                    spin_briefly();
                }
            }
        }
    })
}

fn commit_outer() -> TxResult<()> {
    in_txn(|sys, d| {
        let g = &sys.globals;
        let alg = sys.table.get(d.alg_cache);
        d.nesting_depth -= 1;
        match alg.commit(g, d) {
            Ok(()) => {
                let slot = g.registry.slot(d.slot_id);
                d.alloc.on_tx_commit(&g.heap, &g.registry, slot);
                slot.in_tx.store(false, Ordering::SeqCst);
                alg.cm().on_commit(d);
                Ok(())
            }
            Err(abort) => {
                d.nesting_depth += 1;
                Err(abort)
            }
        }
    })
}

fn abort_outer(abort: Abort) -> Result<(), StripetmError> {
    let words = in_txn(|sys, d| {
        let g = &sys.globals;
        let slot = g.registry.slot(d.slot_id);
        let alg = sys.table.get(d.alg_cache);
        slot.aborts.fetch_add(1, Ordering::Relaxed);
        if matches!(abort, Abort::Explicit) {
            slot.restarts.fetch_add(1, Ordering::Relaxed);
        }
        d.consec_aborts = d.consec_aborts.saturating_add(1);
        alg.rollback(g, d);
        d.alloc.on_tx_abort(&g.heap, slot);
        d.nesting_depth = 0;
        slot.in_tx.store(false, Ordering::SeqCst);
        d.checkpoint.rewind();
        alg.cm().on_abort(d);
        match abort {
            Abort::HeapExhausted { words } => Some(words),
            _ => None,
        }
    });
    match words {
        Some(words) => Err(StripetmError::HeapExhausted { words }),
        None => Ok(()),
    }
}
