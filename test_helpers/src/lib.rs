//! Helpers shared by the tests of the workspace crates.
#![warn(missing_docs)]

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

pub mod tracing;

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the `RUST_LOG` environment variable is set.
///
/// Does nothing if `RUST_LOG` is not set. If `enable_logging` has been set previously, this is a
/// no-op.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Start logging to the test writer, honoring `RUST_LOG` (defaulting to `debug`).
///
/// Safe to call from every test; the subscriber is only installed once per process.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        // another harness may have installed a global subscriber already, that's fine
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    })
}
