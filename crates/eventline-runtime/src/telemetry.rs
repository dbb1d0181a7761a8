//! Tracing subscriber setup
//!
//! Convenience initializer for binaries and tests embedding the runtime.
//! Filtering follows `EVENTLINE_LOG` (standard `EnvFilter` syntax), falling
//! back to `info`.

use tracing_subscriber::EnvFilter;

/// Environment variable controlling the log filter
pub const LOG_ENV_VAR: &str = "EVENTLINE_LOG";

/// Install the global tracing subscriber
///
/// Safe to call more than once; only the first call wins, which keeps test
/// binaries from fighting over the global.
pub fn init() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
