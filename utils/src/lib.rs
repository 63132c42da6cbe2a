//! Shared utilities: tracing setup and statistics counters.

pub mod logging;
pub mod stats;

pub use logging::init_tracing;
pub use stats::StatsCounter;
