//! Remote API subsystem.
//!
//! # Data Flow
//! ```text
//! RetryExecutor
//!     → Transport::call (one attempt)
//!     → http.rs (URL layout, auth injection, JSON POST)
//!     → types.rs (status + body → ApiError taxonomy)
//! ```
//!
//! # Design Decisions
//! - The transport never retries; classification drives the executor
//! - Fatal codes override every other classification
//! - Tests substitute the `Transport` trait with a scripted mock

pub mod http;
pub mod transport;
pub mod types;

pub use http::HttpTransport;
pub use transport::{RemoteCall, Transport};
pub use types::{ApiError, ApiErrorKind, ErrorClass};
