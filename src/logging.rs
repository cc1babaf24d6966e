//! Tracing setup for the binary.
//!
//! The library only emits `tracing` events; hosts decide where they go.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CODELOOM_LOG";

/// Install a stderr subscriber filtered by `CODELOOM_LOG` (default `warn`,
/// or `debug` when `verbose` is set). Safe to call more than once.
pub fn init(verbose: bool) {
    let default = if verbose { "codeloom=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
