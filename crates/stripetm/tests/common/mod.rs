//! Shared scaffolding for the end-to-end scenarios.

use std::sync::Mutex;

use stripetm::Config;

static SERIAL: Mutex<()> = Mutex::new(());

/// Initialise the process (first caller wins), install `algorithm`, and
/// serialize the calling test against the rest of the binary.
pub fn with_algorithm(algorithm: &str) -> std::sync::MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    stripetm::sys_init(&Config::default()).expect("sys_init");
    stripetm::install_algorithm(algorithm).expect("install_algorithm");
    guard
}

/// Every registered algorithm, in registration order.
#[allow(dead_code)]
pub const ALL_ALGORITHMS: &[&str] = &[
    "NOrec",
    "OrecEager",
    "OrecEagerRedo",
    "OrecLazy",
    "LLT",
    "OrecELA",
    "ByteEager",
    "BitEager",
    "CToken",
    "CTokenTurbo",
    "Pipeline",
    "Wealth",
    "Cohorts",
    "CohortsLazy",
    "CohortsEN",
    "CohortsEF",
    "CohortsLI",
    "CohortsLNQX",
    "FastlaneSwitch",
];
