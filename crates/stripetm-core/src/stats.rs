//! Statistics: per-thread commit/abort counters, the consecutive-abort
//! histogram, and the shutdown report.

use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::descriptor::Registry;

/// Histogram of consecutive-abort runs observed at commit time, bucketed
/// 0..=16 with an overflow bucket. High buckets identify toxic
/// transactions.
#[derive(Debug, Clone, Default)]
pub struct ToxicHistogram {
    max: u32,
    buckets: [u64; 18],
}

impl ToxicHistogram {
    /// Record a commit that needed `consec_aborts` retries.
    pub fn on_commit(&mut self, consec_aborts: u32) {
        self.max = self.max.max(consec_aborts);
        let idx = (consec_aborts as usize).min(17);
        self.buckets[idx] += 1;
    }

    /// Longest run seen.
    #[must_use]
    pub fn max_consecutive(&self) -> u32 {
        self.max
    }

    /// Serializable view.
    #[must_use]
    pub fn snapshot(&self) -> ToxicHistogramSnapshot {
        ToxicHistogramSnapshot {
            max: self.max,
            buckets: self.buckets,
        }
    }
}

/// Serializable view of [`ToxicHistogram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToxicHistogramSnapshot {
    pub max: u32,
    pub buckets: [u64; 18],
}

/// Per-thread counters for the shutdown report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadStatsSnapshot {
    pub slot: u32,
    pub commits_ro: u64,
    pub commits_rw: u64,
    pub aborts: u64,
    pub restarts: u64,
}

/// The shutdown report: one row per ever-claimed slot plus the installed
/// algorithm's name.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub algorithm: String,
    pub threads: Vec<ThreadStatsSnapshot>,
}

impl StatsReport {
    /// Collect counters from every slot the registry ever handed out.
    #[must_use]
    pub fn gather(registry: &Registry, algorithm: &str) -> Self {
        let threads = registry
            .iter()
            .map(|(slot, s)| ThreadStatsSnapshot {
                slot,
                commits_ro: s.commits_ro.load(Ordering::Relaxed),
                commits_rw: s.commits_rw.load(Ordering::Relaxed),
                aborts: s.aborts.load(Ordering::Relaxed),
                restarts: s.restarts.load(Ordering::Relaxed),
            })
            .collect();
        Self {
            algorithm: algorithm.to_owned(),
            threads,
        }
    }

    /// Total commits across both kinds.
    #[must_use]
    pub fn total_commits(&self) -> u64 {
        self.threads
            .iter()
            .map(|t| t.commits_ro + t.commits_rw)
            .sum()
    }
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "algorithm: {}", self.algorithm)?;
        for t in &self.threads {
            writeln!(
                f,
                "thread {:>2}: commits_ro={:<8} commits_rw={:<8} aborts={:<8} restarts={}",
                t.slot, t.commits_ro, t.commits_rw, t.aborts, t.restarts
            )?;
        }
        Ok(())
    }
}
