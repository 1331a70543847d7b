//! Process lifecycle for the worker daemon.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → broadcast → worker loop exits after the current batch
//! ```
//!
//! # Design Decisions
//! - The worker never abandons a batch mid-way; shutdown waits for the cycle
//! - A second signal is not special; the process can still be killed

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
