//! Structured logging with `tracing`.
//!
//! All crates log through the `tracing` macros with structured fields
//! (`conn_id`, `peer`, `topic`, ...). The binary installs the global
//! subscriber once via [`init_subscriber`]; tests capture events in memory
//! with [`capture_logs`].

pub mod test_utils;

pub use test_utils::{LogCapture, LogRecord, capture_logs};

/// Initialize the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `level` when set. With `json` the output
/// is one JSON object per line, otherwise compact human-readable text.
/// Subsequent calls are no-ops.
pub fn init_subscriber(level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails if a global default is already set
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}
