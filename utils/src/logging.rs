//! Logging setup.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `default_directive` (e.g. "info" or "lattice_node=debug") applies when
/// `RUST_LOG` is unset, so a node logs at its configured level out of the
/// box while operators can still override per-target from the environment.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
