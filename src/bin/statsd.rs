//! Stats daemon entry point.
//!
//! Takes no arguments and reads no configuration; everything lives under
//! the default socket root. The process never exits on its own: a zero
//! status is unreachable, −1 means the service directory refused the
//! well-known name, and 1 means the ingest listener failed to start or
//! the main loop escaped its pump.

fn main() {
    statsd::init_tracing();
    // Argument vector is deliberately ignored.
    std::process::exit(statsd::bootstrap::run());
}
