//! Subscriber setup for the binary. The library only emits events.

use tracing_subscriber::{EnvFilter, fmt};

/// Initialize logging once per process.
///
/// `RUST_LOG` overrides the default (`info`, `debug` for this crate when
/// `verbose`). Events go to stderr so stdout stays clean for tables and JSON.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,retrieval_harness=debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
