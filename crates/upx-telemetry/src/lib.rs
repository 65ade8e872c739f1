//! Prometheus metrics and structured logging for upx.
//!
//! - Structured logging with tracing (pretty for development, JSON for
//!   production)
//! - Prometheus metrics for the stream, the REST pipeline, order transitions
//!   and reconciliation

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, LogFormat};
pub use metrics::Metrics;
