//! Logging initialization.
//!
//! The engine logs through `tracing`; binaries embedding it pick an output
//! format once at startup.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines, for log shippers.
    Json,
    /// Multi-line human-readable output.
    #[default]
    Pretty,
    /// Single-line human-readable output.
    Compact,
}

/// Installs the global subscriber. Filtering follows `RUST_LOG` and falls back
/// to `info`. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);

        // `try_init` so an embedding application's subscriber wins.
        let _ = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
            LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        };
    });
}

/// Subscriber for tests: output goes through the test harness capture.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
