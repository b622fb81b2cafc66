//! Per-transaction logs: the redo write set, the value read log, and the
//! undo log.
//!
//! The write set is a hash-indexed, insertion-ordered table supporting RAW
//! lookup and masked writeback. Entries for the same address merge: the
//! newer bytes win on the lanes they cover, the mask accumulates. A
//! zero-mask write stays in the table (visible to RAW lookup) but writes
//! nothing back.

use xxhash_rust::xxh3::xxh3_64;

use crate::heap::{Addr, SharedHeap, masked_merge};

/// Stripe indices observed by orec-style read logs and lock lists.
pub type StripeList = Vec<usize>;

// ---------------------------------------------------------------------------
// Write set
// ---------------------------------------------------------------------------

/// One buffered write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEntry {
    pub addr: Addr,
    pub value: u64,
    pub mask: u64,
}

const SLOT_EMPTY: usize = usize::MAX;

/// Hash-indexed redo log with insertion-ordered writeback.
pub struct WriteSet {
    entries: Vec<WriteEntry>,
    /// Open-addressed index over `entries`, rebuilt on growth.
    index: Vec<usize>,
}

impl WriteSet {
    /// Create a write set with room for `capacity` entries before a rehash.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let buckets = (capacity * 2).next_power_of_two().max(16);
        Self {
            entries: Vec::with_capacity(capacity),
            index: vec![SLOT_EMPTY; buckets],
        }
    }

    #[inline]
    fn bucket_of(&self, addr: Addr) -> usize {
        xxh3_64(&addr.0.to_le_bytes()) as usize & (self.index.len() - 1)
    }

    /// Number of buffered writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no write is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffer a write. A later write to the same address merges into the
    /// existing entry.
    pub fn insert(&mut self, addr: Addr, value: u64, mask: u64) {
        let mut b = self.bucket_of(addr);
        loop {
            match self.index[b] {
                SLOT_EMPTY => {
                    self.index[b] = self.entries.len();
                    self.entries.push(WriteEntry { addr, value, mask });
                    if self.entries.len() * 2 > self.index.len() {
                        self.grow();
                    }
                    return;
                }
                i if self.entries[i].addr == addr => {
                    let e = &mut self.entries[i];
                    e.value = masked_merge(e.value, value, mask);
                    e.mask |= mask;
                    return;
                }
                _ => b = (b + 1) & (self.index.len() - 1),
            }
        }
    }

    /// RAW lookup.
    #[must_use]
    pub fn find(&self, addr: Addr) -> Option<WriteEntry> {
        let mut b = self.bucket_of(addr);
        loop {
            match self.index[b] {
                SLOT_EMPTY => return None,
                i if self.entries[i].addr == addr => return Some(self.entries[i]),
                _ => b = (b + 1) & (self.index.len() - 1),
            }
        }
    }

    /// Resolve a masked read against the log and memory: lanes the log
    /// covers come from the log, the rest from `mem`.
    #[must_use]
    pub fn resolve_read(&self, addr: Addr, mem: u64, mask: u64) -> u64 {
        match self.find(addr) {
            Some(e) if e.mask & mask != 0 => masked_merge(mem, e.value, e.mask),
            _ => mem,
        }
    }

    /// Replay every buffered write into the heap, in insertion order.
    pub fn writeback(&self, heap: &SharedHeap) {
        for e in &self.entries {
            heap.store_masked(e.addr, e.value, e.mask);
        }
    }

    /// Iterate buffered writes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &WriteEntry> {
        self.entries.iter()
    }

    /// The entry at insertion position `i`. Lets lock-acquisition loops
    /// walk the set while appending to the caller's lock list.
    #[must_use]
    pub fn entry_at(&self, i: usize) -> WriteEntry {
        self.entries[i]
    }

    /// Drop every entry, keeping capacity.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.index.fill(SLOT_EMPTY);
    }

    fn grow(&mut self) {
        let buckets = self.index.len() * 2;
        self.index = vec![SLOT_EMPTY; buckets];
        for (i, e) in self.entries.iter().enumerate() {
            let mut b = xxh3_64(&e.addr.0.to_le_bytes()) as usize & (buckets - 1);
            while self.index[b] != SLOT_EMPTY {
                b = (b + 1) & (buckets - 1);
            }
            self.index[b] = i;
        }
    }
}

impl Default for WriteSet {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl std::fmt::Debug for WriteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSet")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Value read log
// ---------------------------------------------------------------------------

/// One observed read: address, the value seen, and the lanes that matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueEntry {
    pub addr: Addr,
    pub value: u64,
    pub mask: u64,
}

/// Value-based read log (sequence-lock algorithms).
#[derive(Debug, Default)]
pub struct ValueLog {
    entries: Vec<ValueEntry>,
}

impl ValueLog {
    /// Record an observed read.
    #[inline]
    pub fn log(&mut self, addr: Addr, value: u64, mask: u64) {
        self.entries.push(ValueEntry { addr, value, mask });
    }

    /// Re-read every logged address; true when every observation still
    /// holds on its logged lanes.
    #[must_use]
    pub fn still_valid(&self, heap: &SharedHeap) -> bool {
        self.entries
            .iter()
            .all(|e| crate::heap::masked_eq(heap.load(e.addr), e.value, e.mask))
    }

    /// Number of logged reads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, keeping capacity.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Undo log
// ---------------------------------------------------------------------------

/// One prior value captured before an in-place write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoEntry {
    pub addr: Addr,
    pub prior: u64,
    pub mask: u64,
}

/// Undo log for eager (in-place) algorithms; replayed in reverse on abort.
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    /// Capture the prior value of the lanes about to be overwritten.
    #[inline]
    pub fn log(&mut self, addr: Addr, prior: u64, mask: u64) {
        self.entries.push(UndoEntry { addr, prior, mask });
    }

    /// Replay in reverse, restoring the captured lanes.
    pub fn undo(&self, heap: &SharedHeap) {
        for e in self.entries.iter().rev() {
            heap.store_masked(e.addr, e.prior, e.mask);
        }
    }

    /// Number of captured writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, keeping capacity.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}
