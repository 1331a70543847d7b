//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Admitted call:
//!     → timeouts.rs (deadline per attempt)
//!     → On failure: retries.rs (classify, refresh once or back off)
//!     → backoff.rs (exponential delay + jitter, slept on the clock)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every remote attempt has a deadline
//! - Only transient failures are retried; policy and validation never are
//! - An expired credential earns exactly one refresh and one more attempt

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use retries::{Invocation, RetryExecutor, RetryPolicy};
