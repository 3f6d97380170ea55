//! Logging setup for binaries and tests that drive the orchestrator.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info";

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Later calls are no-ops. Returns whether this call installed the subscriber.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    init_with_filter(filter)
}

/// Like [`init`] with explicit directives, e.g. `"vrelay_ops=debug,info"`.
pub fn init_with(directives: &str) -> bool {
    init_with_filter(EnvFilter::new(directives))
}

fn init_with_filter(filter: EnvFilter) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init()
        .is_ok()
}
