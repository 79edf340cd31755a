//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → access_log.rs (one record per finished request)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields on every event, never preformatted strings
//! - Request ID flows from the `x-request-id` header into the request context
//! - Metrics are cheap (atomic increments) and no-ops until a recorder is installed

pub mod access_log;
pub mod logging;
pub mod metrics;

pub use access_log::{AccessLogSink, AccessRecord, NoopAccessLog, TracingAccessLog};
