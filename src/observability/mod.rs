//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Gateway, executor, limiter, worker produce:
//!     → logging.rs (structured log events on stderr)
//!     → metrics.rs (counters, histograms)
//!
//! Consumers:
//!     → Log aggregation (stderr)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Request ID flows from the gateway into logs and audit entries
//! - Metrics are cheap and no-ops until an exporter is installed
//! - The audit journal is separate from logs and never replaced by them

pub mod logging;
pub mod metrics;
