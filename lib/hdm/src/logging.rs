//! Tracing initialization for embedding binaries. HDM itself only emits `tracing`
//! spans/events (see `orchestrator::process_item`); the host process chooses how those
//! are rendered. This is a convenience default for hosts that don't already run their
//! own subscriber, grounded in the Debian download manager's `init_logging_stderr`.

use tracing_subscriber::EnvFilter;

/// Install a stderr `tracing_subscriber::fmt` layer filtered by `RUST_LOG`, defaulting
/// to `info` with `hdm=debug`. Idempotent per process: a second call is a harmless
/// no-op if a global subscriber is already installed.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hdm=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .try_init();
}
