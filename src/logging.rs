//! Diagnostic tracing for operators.
//!
//! The audit log under `.changeguard/` is the durable record of what the
//! guard decided; this stream is only for debugging and is never persisted.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output goes to stderr in compact
/// form so JSON on stdout stays machine-readable.
///
/// ```bash
/// RUST_LOG=changeguard=debug changeguard apply --group 01J...
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
