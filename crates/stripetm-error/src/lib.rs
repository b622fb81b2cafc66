use thiserror::Error;

/// Primary error type for stripetm operations.
///
/// Only conditions that surface above the begin/commit boundary live here.
/// Conflict, seal, timeout, and swap aborts are internal control flow and
/// retry transparently; they never become a `StripetmError`.
#[derive(Error, Debug)]
pub enum StripetmError {
    /// The algorithm named by `STM_CONFIG` (or passed to `install_algorithm`)
    /// is not registered.
    #[error("unknown STM algorithm: '{name}'")]
    UnknownAlgorithm { name: String },

    /// Every descriptor slot is claimed by a live thread.
    ///
    /// The slot table is bounded by the bytelock reader-array dimension;
    /// registration is refused rather than degraded.
    #[error("thread slots exhausted: {max_threads} threads already registered")]
    ThreadSlotsExhausted { max_threads: usize },

    /// The word heap could not satisfy a transactional allocation.
    ///
    /// Raised at the commit boundary; uncommitted allocations have already
    /// been discarded.
    #[error("transactional heap exhausted: requested {words} words")]
    HeapExhausted { words: usize },

    /// A non-transactional allocation request exceeded the arena.
    #[error("word arena exhausted: requested {words} words, {available} available")]
    ArenaExhausted { words: usize, available: usize },

    /// In-flight irrevocability was requested from an algorithm that cannot
    /// provide it.
    #[error("algorithm '{algorithm}' does not support in-flight irrevocability")]
    IrrevocabilityUnsupported { algorithm: &'static str },

    /// The library was used before `sys_init`.
    #[error("stripetm is not initialised (call sys_init first)")]
    NotInitialised,

    /// The calling thread has no descriptor (call `thread_init` first).
    #[error("calling thread is not registered (call thread_init first)")]
    ThreadNotRegistered,

    /// A configuration value was structurally invalid (not merely malformed;
    /// malformed values are warned about and defaulted).
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StripetmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_stable() {
        let e = StripetmError::UnknownAlgorithm {
            name: "NoSuchAlg".into(),
        };
        assert_eq!(e.to_string(), "unknown STM algorithm: 'NoSuchAlg'");

        let e = StripetmError::ThreadSlotsExhausted { max_threads: 60 };
        assert!(e.to_string().contains("60"));

        let e = StripetmError::IrrevocabilityUnsupported { algorithm: "NOrec" };
        assert!(e.to_string().contains("NOrec"));
    }
}
