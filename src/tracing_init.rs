//! Tracing initialization for tests and binaries
//!
//! Provides centralized tracing setup with environment-based filtering.

use std::path::Path;

use snafu::ResultExt;

#[cfg(test)]
use once_cell::sync::Lazy;

use crate::config::{ConfigError, LogFileOpenSnafu};

/// Initialize tracing for tests with environment-based filtering
///
/// Uses RUST_LOG environment variable to control output:
/// - `RUST_LOG=gtbridge=debug` - Show all debug output
/// - `RUST_LOG=gtbridge::cluster=trace` - Trace specific module
/// - `RUST_LOG=gtbridge=debug,gtbridge::cache=trace` - Mixed levels
///
/// Call this once at the start of each test that needs tracing.
/// Multiple calls are safe (uses once_cell).
#[cfg(test)]
pub fn init_test_tracing() {
    static TRACING: Lazy<()> = Lazy::new(|| {
        use tracing_subscriber::{fmt, EnvFilter};

        // Try to read RUST_LOG, fall back to "gtbridge=warn" if not set
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gtbridge=warn"));

        fmt()
            .with_env_filter(filter)
            .with_target(true)           // Show module path
            .with_thread_ids(false)      // Usually not needed for tests
            .with_line_number(true)      // Show source line
            .with_test_writer()          // Capture test output
            .init();
    });

    // Force initialization
    Lazy::force(&TRACING);
}

/// Initialize tracing for the `gtbridge` binary.
///
/// `level` sets the default filter when `RUST_LOG` is unset. When
/// `log_file` names a path, output goes to a non-blocking file
/// appender instead of stderr; the returned guard must be held for the
/// life of the process or buffered lines on it are lost on drop.
///
/// A `log_file` that can't be opened (bad permissions, missing parent
/// directory) is reported as a `ConfigError`, not a panic, so it takes
/// the same fatal-config-error exit path as every other config
/// problem.
pub fn init_tracing(
    level: &str,
    log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, ConfigError> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("gtbridge={level}")));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context(LogFileOpenSnafu {
                    path: path.display().to_string(),
                })?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .init();
            Ok(None)
        }
    }
}
