//! Tracing infrastructure for the daemon.
//!
//! Logging is part of the daemon's runtime contract (setup failures and loop
//! anomalies must leave a record), so unlike a latency-critical library the
//! subscriber is always compiled in and the binary initializes it at startup.

/// Initialize the tracing subscriber with timestamps.
///
/// Call this once at the start of the binary or of an integration test.
/// Respects `RUST_LOG`; defaults to `statsd=info`.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("statsd=info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

pub(crate) use tracing::{debug, error, info, warn};
