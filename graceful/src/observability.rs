//! Logging setup for hosting applications.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing-subscriber` fmt subscriber as the global default.
///
/// Filtering honours `RUST_LOG`; `default_directive` (e.g. `"info"` or
/// `"graceful=debug"`) applies when it is unset or invalid. Returns false if
/// a global subscriber was already installed, which is left in place.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Like [`init_tracing`], but emits one JSON object per line.
pub fn init_json_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
