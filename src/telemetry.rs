//! Opt-in log output.
//!
//! The library only emits `tracing` events; applications that have no
//! subscriber of their own can install a plain one here.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`
/// (or `debug` when `debug` is set). Does nothing if one is already installed.
pub fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
