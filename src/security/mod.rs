//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Outgoing call:
//!     → rate_limit.rs (per-tenant token bucket, bounded wait)
//!
//! Anything printed, logged or audited:
//!     → secrets.rs (mask tokens and webhook codes)
//!
//! Offline events:
//!     → secrets.rs (constant-time application token check)
//! ```
//!
//! # Design Decisions
//! - Limiter state lives in the shared state store so every process sees one bucket
//! - A wait longer than the budget fails fast instead of sleeping and failing later
//! - Secrets are masked at the output boundary, not at the source

pub mod rate_limit;
pub mod secrets;

pub use rate_limit::RateLimiter;
pub use secrets::{mask_secrets, secure_compare};
