//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + GUARD_* environment
//!     → loader.rs (parse, deserialize, apply overrides)
//!     → validation.rs (semantic checks)
//!     → GuardConfig (validated, immutable)
//!     → components built from their sections
//!
//! On file change (worker only):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → PolicyConfig sent to the worker loop
//!     → PolicyGateway swaps its Policy atomically
//! ```
//!
//! # Design Decisions
//! - Only the policy section is hot-reloadable; everything else needs a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::GuardConfig;
pub use schema::PolicyConfig;
pub use schema::TenantConfig;
