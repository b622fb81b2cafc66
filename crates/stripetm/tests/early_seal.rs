//! §8 scenario 6: CohortsLNQX with a write early-seal threshold of 2.
//!
//! Four threads run transactions of three writes each. A transaction's
//! second counted write seals the cohort, so membership is bounded, yet
//! nobody may starve: every transaction must commit within a bounded
//! number of retries.

use std::sync::{Arc, Barrier};
use std::thread;

use stripetm::Config;

const THREADS: usize = 4;
const PER_THREAD: u64 = 50;

#[test]
fn write_seal_bounds_cohorts_without_starvation() {
    stripetm::sys_init(
        &Config::default()
            .with_algorithm("CohortsLNQX")
            .with_seal_thresholds(-1, 2, -1),
    )
    .expect("sys_init");

    // One disjoint triple of words per thread, plus a shared counter.
    let shared = stripetm::alloc_words(1).expect("alloc");
    let barrier = Arc::new(Barrier::new(THREADS));
    let mut handles = Vec::new();
    for t in 0..THREADS {
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            stripetm::thread_init().expect("thread_init");
            let mine = stripetm::alloc_words(3).expect("alloc");
            barrier.wait();
            for i in 0..PER_THREAD {
                stripetm::atomically(|tx| {
                    tx.write(mine, i)?;
                    tx.write(mine.offset(1), i + 1)?;
                    tx.write(mine.offset(2), i + 2)?;
                    let c = tx.read(shared)?;
                    tx.write(shared, c + 1)
                });
            }
            (t, mine)
        }));
    }

    for h in handles {
        let (_t, mine) = h.join().expect("worker");
        assert_eq!(stripetm::peek(mine).expect("peek"), PER_THREAD - 1);
        assert_eq!(stripetm::peek(mine.offset(1)).expect("peek"), PER_THREAD);
        assert_eq!(stripetm::peek(mine.offset(2)).expect("peek"), PER_THREAD + 1);
    }
    assert_eq!(
        stripetm::peek(shared).expect("peek"),
        THREADS as u64 * PER_THREAD
    );

    // Bounded retries: with four threads, the seal can cost at most a
    // cohort's worth of retries per commit; far below this generous bound.
    let report = stripetm::sys_shutdown().expect("report");
    let commits: u64 = report.threads.iter().map(|t| t.commits_rw).sum();
    let aborts: u64 = report.threads.iter().map(|t| t.aborts).sum();
    assert_eq!(commits, THREADS as u64 * PER_THREAD, "{report}");
    assert!(
        aborts <= commits * (THREADS as u64) * 4,
        "starvation suspected: {report}"
    );
    println!("[early-seal] commits={commits} aborts={aborts}");
}
