//! Process configuration, read once at `sys_init`.
//!
//! Malformed environment values never fail init; they are warned about and
//! defaulted, so a bad shell export cannot take the process down.

/// Environment variable naming the initial algorithm.
pub const ENV_ALGORITHM: &str = "STM_CONFIG";
/// Early-seal threshold on reads per cohort (−1 disables).
pub const ENV_SEAL_READS: &str = "STM_READS";
/// Early-seal threshold on writes per cohort (−1 disables).
pub const ENV_SEAL_WRITES: &str = "STM_WRITES";
/// Early-seal threshold on consecutive aborts (−1 disables).
pub const ENV_SEAL_ABORTS: &str = "STM_ABORTS";
/// When set truthy, `sys_shutdown` prints the per-thread table.
pub const ENV_STATS: &str = "STM_STATS";

/// Default initial algorithm.
pub const DEFAULT_ALGORITHM: &str = "NOrec";

/// Everything `sys_init` needs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial algorithm name.
    pub algorithm: String,
    /// Word arena capacity.
    pub heap_words: usize,
    /// Stripe count for the metadata tables (power of two).
    pub n_stripes: usize,
    /// Early-seal thresholds; −1 disables.
    pub seal_reads: i64,
    pub seal_writes: i64,
    pub seal_aborts: i64,
    /// Print the per-thread table at shutdown.
    pub stats_on_shutdown: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            algorithm: DEFAULT_ALGORITHM.to_owned(),
            heap_words: 1 << 20,
            n_stripes: 1 << 16,
            seal_reads: -1,
            seal_writes: -1,
            seal_aborts: -1,
            stats_on_shutdown: false,
        }
    }
}

impl Config {
    /// Build a config from the environment, defaulting leniently.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        match std::env::var(ENV_ALGORITHM) {
            Ok(name) if !name.trim().is_empty() => cfg.algorithm = name.trim().to_owned(),
            Ok(_) | Err(std::env::VarError::NotPresent) => {
                tracing::info!(
                    target: "stripetm.config",
                    default = DEFAULT_ALGORITHM,
                    "{ENV_ALGORITHM} not set, using default algorithm"
                );
            }
            Err(e) => {
                tracing::warn!(target: "stripetm.config", error = %e, "ignoring {ENV_ALGORITHM}");
            }
        }
        cfg.seal_reads = env_i64(ENV_SEAL_READS, cfg.seal_reads);
        cfg.seal_writes = env_i64(ENV_SEAL_WRITES, cfg.seal_writes);
        cfg.seal_aborts = env_i64(ENV_SEAL_ABORTS, cfg.seal_aborts);
        cfg.stats_on_shutdown = env_truthy(ENV_STATS);
        cfg
    }

    /// Override the initial algorithm.
    #[must_use]
    pub fn with_algorithm(mut self, name: &str) -> Self {
        self.algorithm = name.to_owned();
        self
    }

    /// Override the arena capacity.
    #[must_use]
    pub fn with_heap_words(mut self, words: usize) -> Self {
        self.heap_words = words;
        self
    }

    /// Override the early-seal thresholds.
    #[must_use]
    pub fn with_seal_thresholds(mut self, reads: i64, writes: i64, aborts: i64) -> Self {
        self.seal_reads = reads;
        self.seal_writes = writes;
        self.seal_aborts = aborts;
        self
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    target: "stripetm.config",
                    value = raw.as_str(),
                    "malformed {key}, using {default}"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn env_truthy(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}
