// src/utils/logging.rs
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Respects `RUST_LOG`, defaulting to `info`.
///
/// Later calls are no-ops.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
