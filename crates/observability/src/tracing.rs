//! Tracing/logging initialization.
//!
//! Logs are JSON lines filtered by `RUST_LOG`. When unset, job services log
//! at `debug` (progress reports, ignored regressions) and everything else at
//! `info`.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,storyforge_infra=debug";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(true)
        .with_target(false)
        .try_init();
}
