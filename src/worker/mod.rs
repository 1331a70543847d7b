//! Offline queue worker.
//!
//! # Data Flow
//! ```text
//! runner.rs loop (until shutdown):
//!     → queue.rs poll (non-destructive read, batch token)
//!     → per item: schema check, application token check
//!     → processor.rs EventHandler (usually through the PolicyGateway)
//!     → failure: retry_budget.rs counter
//!     → counter at bound: dead_letter.rs write, then acknowledge
//!     → one acknowledgement per batch
//! ```
//!
//! # Design Decisions
//! - Dead letters are written before the item is acknowledged; a failed write
//!   keeps the item queued
//! - One cooperative loop per worker; items in a batch run sequentially
//! - Shutdown is observed only between batches

pub mod dead_letter;
pub mod processor;
pub mod queue;
pub mod retry_budget;
pub mod runner;

pub use dead_letter::{DeadLetterRecord, DeadLetterStore};
pub use processor::{EventHandler, GatewayHandler, HandlerError, LoggingHandler};
pub use queue::{GatewayQueue, MemoryQueue, OfflineQueue, QueueBatch, QueueItem};
pub use retry_budget::{RetryBudget, RetryRecord};
pub use runner::{CycleReport, OfflineWorker, WorkerError, WorkerOptions, WorkerState};
