//! Tracing subscriber setup.
//!
//! The crate itself only emits `tracing` events; embedding binaries and
//! tests call this to get a formatted subscriber honoring `RUST_LOG`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber. `default_filter` applies when `RUST_LOG`
/// is unset. Safe to call more than once; later calls are no-ops.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
