//! Boundary behaviours of the public surface: empty transactions, flat
//! nesting, masked writes, explicit restart, the read-only fast path, the
//! validate-now hook, and transactional allocation.

mod common;

use std::cell::Cell;

use stripetm::{Abort, StripetmError, WordRange};

#[test]
fn empty_transaction_commits() {
    let _guard = common::with_algorithm("NOrec");
    stripetm::atomically(|_tx| Ok(()));
}

#[test]
fn read_only_transaction_leaves_the_clock_alone() {
    let _guard = common::with_algorithm("NOrec");
    let v = stripetm::alloc_words(1).expect("alloc");
    stripetm::poke(v, 5).expect("poke");

    let g = &stripetm::system().expect("system").globals;
    let before = g.now();
    let seen = stripetm::atomically(|tx| tx.read(v));
    assert_eq!(seen, 5);
    assert_eq!(g.now(), before, "read-only commit touched the clock");
}

#[test]
fn flat_nesting_subsumes() {
    let _guard = common::with_algorithm("OrecLazy");
    let v = stripetm::alloc_words(1).expect("alloc");

    let out = stripetm::atomically(|tx| {
        tx.write(v, 3)?;
        let doubled = tx.subsume(|inner| {
            let cur = inner.read(v)?;
            inner.write(v, cur * 2)?;
            inner.read(v)
        })?;
        Ok(doubled)
    });
    assert_eq!(out, 6);
    assert_eq!(stripetm::peek(v).expect("peek"), 6);
}

#[test]
fn nested_atomically_is_flat() {
    let _guard = common::with_algorithm("NOrec");
    let v = stripetm::alloc_words(1).expect("alloc");

    let out = stripetm::atomically(|tx| {
        tx.write(v, 1)?;
        let inner = stripetm::atomically(|tx2| tx2.read(v));
        tx.write(v, inner + 10)?;
        Ok(inner)
    });
    assert_eq!(out, 1, "inner scope sees the outer buffered write");
    assert_eq!(stripetm::peek(v).expect("peek"), 11);
}

#[test]
fn masked_write_merges_on_read_and_commit() {
    let _guard = common::with_algorithm("NOrec");
    let v = stripetm::alloc_words(1).expect("alloc");
    stripetm::poke(v, 0x1111_1111_1111_1111).expect("poke");

    stripetm::atomically(|tx| {
        tx.write_masked(v, 0x0000_0000_0000_00AA, 0x0000_0000_0000_00FF)?;
        // Read-after-write sees the partial lanes over memory.
        let merged = tx.read(v)?;
        assert_eq!(merged, 0x1111_1111_1111_11AA);
        Ok(())
    });
    assert_eq!(stripetm::peek(v).expect("peek"), 0x1111_1111_1111_11AA);
}

#[test]
fn zero_mask_write_is_a_logged_noop() {
    let _guard = common::with_algorithm("OrecEagerRedo");
    let v = stripetm::alloc_words(1).expect("alloc");
    stripetm::poke(v, 42).expect("poke");

    stripetm::atomically(|tx| {
        tx.write_masked(v, 99, 0)?;
        let seen = tx.read(v)?;
        assert_eq!(seen, 42, "no lanes written, memory value prevails");
        Ok(())
    });
    assert_eq!(stripetm::peek(v).expect("peek"), 42);
}

#[test]
fn restart_reexecutes_from_the_checkpoint() {
    let _guard = common::with_algorithm("OrecEager");
    let v = stripetm::alloc_words(1).expect("alloc");

    let attempts = Cell::new(0_u32);
    stripetm::atomically(|tx| {
        attempts.set(attempts.get() + 1);
        tx.write(v, u64::from(attempts.get()))?;
        if attempts.get() < 3 {
            return tx.restart();
        }
        Ok(())
    });
    assert_eq!(attempts.get(), 3);
    // Each aborted attempt's in-place write was undone; only the third
    // committed.
    assert_eq!(stripetm::peek(v).expect("peek"), 3);
}

#[test]
fn validate_now_passes_on_a_quiet_heap() {
    for alg in ["NOrec", "OrecEager", "CohortsEN"] {
        let _guard = common::with_algorithm(alg);
        let v = stripetm::alloc_words(1).expect("alloc");
        stripetm::atomically(|tx| {
            let _ = tx.read(v)?;
            tx.validate_now()
        });
    }
}

#[test]
fn transactional_alloc_survives_retry_and_frees_defer() {
    let _guard = common::with_algorithm("NOrec");

    let attempts = Cell::new(0_u32);
    let block = stripetm::atomically(|tx| {
        attempts.set(attempts.get() + 1);
        let block = tx.alloc(4)?;
        tx.write(block, 0xFEED)?;
        if attempts.get() < 2 {
            // The first attempt's allocation is unwound with the abort.
            return tx.restart();
        }
        Ok(block)
    });
    assert_eq!(stripetm::peek(block).expect("peek"), 0xFEED);

    stripetm::atomically(|tx| {
        tx.free(WordRange {
            start: block,
            len: 4,
        });
        Ok(())
    });
}

#[test]
fn heap_exhaustion_surfaces_through_try_atomically() {
    let _guard = common::with_algorithm("NOrec");
    let result: Result<(), StripetmError> = stripetm::try_atomically(|tx| {
        let _ = tx.alloc(u32::MAX)?;
        Ok(())
    });
    assert!(
        matches!(result, Err(StripetmError::HeapExhausted { .. })),
        "expected heap exhaustion, got {result:?}"
    );
    // The system is still usable afterwards.
    stripetm::atomically(|_tx| Ok(()));
}

#[test]
fn conflict_aborts_are_counted() {
    let _guard = common::with_algorithm("NOrec");
    let v = stripetm::alloc_words(1).expect("alloc");

    // Force one deterministic conflict: a transaction reads, then the
    // heap changes under it via a second thread, then it re-reads.
    let first_pass = Cell::new(true);
    stripetm::atomically(|tx| {
        let _ = tx.read(v)?;
        if first_pass.get() {
            first_pass.set(false);
            std::thread::spawn(move || {
                stripetm::atomically(|tx2| {
                    let cur = tx2.read(v)?;
                    tx2.write(v, cur + 1)
                });
            })
            .join()
            .expect("interferer");
            // Re-reading now sees a moved sequence lock; revalidation of
            // the value log fails and the transaction retries.
            let _ = tx.read(v)?;
        }
        Ok(())
    });

    let report = stripetm::sys_shutdown().expect("report");
    assert!(report.threads.iter().any(|t| t.aborts > 0), "{report}");
}

#[test]
fn unknown_algorithm_is_rejected() {
    let _guard = common::with_algorithm("NOrec");
    assert!(matches!(
        stripetm::install_algorithm("NoSuchAlgorithm"),
        Err(StripetmError::UnknownAlgorithm { .. })
    ));
}

#[test]
fn abort_kinds_display() {
    // The internal kinds never escape, but their diagnostics do.
    assert_eq!(Abort::Conflict.to_string(), "conflict");
    assert_eq!(Abort::Swap.to_string(), "algorithm swap");
}
