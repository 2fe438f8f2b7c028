//! Monitoring Module
//!
//! Provides observability for training sessions:
//! - Structured logging setup
//! - Prometheus round metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, LogFormat, LogLevel, LoggerConfig};
pub use metrics::{Counter, Gauge, Histogram, RoundMetrics};
