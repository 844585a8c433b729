//! Telemetry module for logging and metrics.
//!
//! Provides:
//! - Logging initialization from configuration or RUST_LOG
//! - Per-interface packet counters

mod logging;
mod metrics;

pub use logging::{init_logging, LogFormat};
pub use metrics::{Counter, Gauge, InterfaceStats, MetricsRegistry};
