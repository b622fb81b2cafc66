//! §8 scenario 4 across every algorithm: N threads each run transactions
//! of {V[0] += V[1]; V[1] += 1}. Serializability fixes both outcomes
//! exactly: after K committed transactions V[1] == K, and V[0] equals
//! 0 + 1 + … + (K − 1) under any total commit order.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 4;
const PER_THREAD: u64 = 250;

fn run_arithmetic(algorithm: &str) {
    let _guard = common::with_algorithm(algorithm);
    let v = stripetm::alloc_words(2).expect("alloc");

    let barrier = Arc::new(Barrier::new(THREADS));
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            stripetm::thread_init().expect("thread_init");
            barrier.wait();
            for _ in 0..PER_THREAD {
                stripetm::atomically(|tx| {
                    let sum = tx.read(v)?;
                    let count = tx.read(v.offset(1))?;
                    tx.write(v, sum + count)?;
                    tx.write(v.offset(1), count + 1)
                });
            }
        }));
    }
    for h in handles {
        h.join().expect("worker");
    }

    let total = THREADS as u64 * PER_THREAD;
    let v0 = stripetm::peek(v).expect("peek");
    let v1 = stripetm::peek(v.offset(1)).expect("peek");
    assert_eq!(v1, total, "{algorithm}: committed count");
    assert_eq!(
        v0,
        total * (total - 1) / 2,
        "{algorithm}: arithmetic inconsistent with any serial order"
    );
    println!("[arithmetic] {algorithm}: v0={v0} v1={v1}");
}

#[test]
fn serial_arithmetic_norec() {
    run_arithmetic("NOrec");
}

#[test]
fn serial_arithmetic_orec_family() {
    for alg in ["OrecEager", "OrecEagerRedo", "OrecLazy", "LLT", "OrecELA"] {
        run_arithmetic(alg);
    }
}

#[test]
fn serial_arithmetic_visible_readers() {
    for alg in ["ByteEager", "BitEager"] {
        run_arithmetic(alg);
    }
}

#[test]
fn serial_arithmetic_ordered() {
    for alg in ["CToken", "CTokenTurbo", "Pipeline", "Wealth"] {
        run_arithmetic(alg);
    }
}

#[test]
fn serial_arithmetic_cohorts() {
    for alg in [
        "Cohorts",
        "CohortsLazy",
        "CohortsEN",
        "CohortsEF",
        "CohortsLI",
        "CohortsLNQX",
    ] {
        run_arithmetic(alg);
    }
}

#[test]
fn serial_arithmetic_fastlane() {
    run_arithmetic("FastlaneSwitch");
}
