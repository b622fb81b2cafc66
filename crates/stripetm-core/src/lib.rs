//! Core primitives for the stripetm transactional memory library.
//!
//! This crate holds everything the algorithms share: the word arena, the
//! ownership-record / bytelock / bitlock tables, the per-transaction logs,
//! the descriptor and its registry, epoch-based reclamation, the
//! abort/checkpoint control-flow types, the dispatch table with the
//! hot-swap protocol, and statistics. The algorithms themselves live in
//! the `stripetm` crate.

pub mod bitlock;
pub mod bytelock;
pub mod cache_aligned;
pub mod checkpoint;
pub mod descriptor;
pub mod dispatch;
pub mod epoch;
pub mod filter;
pub mod global;
pub mod heap;
pub mod logs;
pub mod orec;
pub mod stats;
pub mod sync;

pub use bitlock::{BitLock, BitLockTable, ReaderRecord};
pub use bytelock::{ByteLock, ByteLockTable, MAX_THREADS};
pub use cache_aligned::{CACHE_LINE_BYTES, CacheAligned};
pub use checkpoint::{Abort, BeginStatus, Checkpoint, TxResult};
pub use descriptor::{Descriptor, Mode, NO_ORDER, Registry, Slot, status, turn};
pub use dispatch::{
    Algorithm, AlgorithmTable, BackoffCm, ContentionManager, NoopCm, install_algorithm,
};
pub use epoch::{EpochMetricsSnapshot, GLOBAL_EPOCH_METRICS, TxAlloc};
pub use filter::{AtomicBloomFilter, BloomFilter, FILTER_BITS};
pub use global::{FL_PRIORITY_BIT, GlobalsConfig, SealThresholds, StmGlobals, SwitchController};
pub use heap::{Addr, MASK_FULL, SharedHeap, WordRange, masked_eq, masked_merge};
pub use logs::{StripeList, UndoLog, ValueLog, WriteEntry, WriteSet};
pub use orec::{OREC_OWNED_BIT, OrecEntry, OrecTable, is_owned, owner_of, owner_word};
pub use stats::{StatsReport, ThreadStatsSnapshot, ToxicHistogram};
pub use sync::{Backoff, spin_briefly, spin_hint, tick_ns};
