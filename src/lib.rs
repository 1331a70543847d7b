//! Policy-gated executor for remote API calls, plus an offline queue worker.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod digest;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod observability;
pub mod policy;
pub mod resilience;
pub mod security;
pub mod store;
pub mod worker;

pub use config::schema::GuardConfig;
pub use error::{GuardError, GuardResult};
pub use gateway::{CallOutcome, CallRequest, PlanExecution, PolicyGateway};
pub use lifecycle::Shutdown;
pub use worker::OfflineWorker;
