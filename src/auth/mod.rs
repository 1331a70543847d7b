//! Credential subsystem.
//!
//! # Data Flow
//! ```text
//! RetryExecutor sees expired_token
//!     → RefreshCoordinator::refresh_if_needed(tenant, stale)
//!     → per-tenant mutex + lease record in refresh_leases
//!     → Refresher (oauth.rs) exchanges the refresh token
//!     → CredentialStore persists the new pair
//! ```
//!
//! # Design Decisions
//! - Exactly one refresh in flight per tenant, in-process and cross-process
//! - Waiters reload from storage instead of refreshing again
//! - Tokens never appear in Debug output

pub mod credentials;
pub mod oauth;
pub mod refresh;

pub use credentials::{Credential, CredentialStore};
pub use oauth::OAuthRefresher;
pub use refresh::{RefreshCoordinator, Refresher};
