//! Error taxonomy of the request executor.

use thiserror::Error;

use crate::api::types::is_fatal_code;
use crate::config::loader::ConfigError;
use crate::store::StoreError;

/// Everything a guarded call can fail with.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Method name or parameter shape rejected before any network traffic.
    #[error("validation failed for '{method}': {reason}")]
    Validation { method: String, reason: String },

    /// Allowlist, confirmation or plan requirement not satisfied.
    #[error("policy rejected '{method}': {reason}")]
    Policy { method: String, reason: String },

    /// No rate-limit token became available within the wait budget.
    #[error("rate limit wait for '{key}' needs {needed_ms}ms, budget is {max_wait_ms}ms")]
    RateLimitTimeout {
        key: String,
        needed_ms: u64,
        max_wait_ms: u64,
    },

    /// Credentials stayed expired after a refresh.
    #[error("credentials for '{method}' expired after {attempts} attempts")]
    AuthExpired { method: String, attempts: u32 },

    /// Transient failures exhausted the retry budget.
    #[error("'{method}' failed after {retries} retries: {code}: {message}")]
    TransientServer {
        method: String,
        retries: u32,
        code: String,
        message: String,
    },

    /// Non-retryable error returned by the remote API.
    #[error("'{method}' failed with {code} (status {status}) after {attempts} attempts: {message}")]
    Remote {
        method: String,
        code: String,
        status: u16,
        message: String,
        attempts: u32,
    },

    #[error("plan '{0}' not found")]
    PlanNotFound(String),

    #[error("plan '{0}' expired")]
    PlanExpired(String),

    #[error("plan '{0}' already executed")]
    PlanAlreadyExecuted(String),

    /// The idempotency key was reused with different parameters or result.
    #[error("idempotency conflict for '{method}' key '{key}': {reason}")]
    IdempotencyConflict {
        method: String,
        key: String,
        reason: String,
    },

    /// Credential refresh failed or another refresher did not complete.
    #[error("credential refresh for '{tenant}' failed: {reason}")]
    Refresh { tenant: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for guarded operations.
pub type GuardResult<T> = Result<T, GuardError>;

impl GuardError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            GuardError::Validation { .. } => "validation_error",
            GuardError::Policy { .. } => "policy_error",
            GuardError::RateLimitTimeout { .. } => "rate_limit_timeout",
            GuardError::AuthExpired { .. } => "auth_expired",
            GuardError::TransientServer { .. } => "transient_server_error",
            GuardError::Remote { .. } => "remote_error",
            GuardError::PlanNotFound(_) => "plan_not_found",
            GuardError::PlanExpired(_) => "plan_expired",
            GuardError::PlanAlreadyExecuted(_) => "plan_already_executed",
            GuardError::IdempotencyConflict { .. } => "idempotency_conflict",
            GuardError::Refresh { .. } => "refresh_error",
            GuardError::Store(_) => "store_error",
            GuardError::Config(_) => "config_error",
        }
    }

    /// Process exit code for the command surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            GuardError::Validation { .. }
            | GuardError::Policy { .. }
            | GuardError::PlanNotFound(_)
            | GuardError::PlanExpired(_)
            | GuardError::PlanAlreadyExecuted(_)
            | GuardError::IdempotencyConflict { .. }
            | GuardError::Config(_) => 2,
            _ => 1,
        }
    }

    /// Remote error code carried by the failure, if any.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            GuardError::TransientServer { code, .. } | GuardError::Remote { code, .. } => {
                Some(code.as_str())
            }
            GuardError::AuthExpired { .. } => Some("expired_token"),
            _ => None,
        }
    }

    /// Retries consumed before the failure surfaced.
    pub fn retries(&self) -> u32 {
        match self {
            GuardError::TransientServer { retries, .. } => *retries,
            GuardError::Remote { attempts, .. } | GuardError::AuthExpired { attempts, .. } => {
                attempts.saturating_sub(1)
            }
            _ => 0,
        }
    }

    /// Errors that no amount of retrying will fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            GuardError::AuthExpired { .. } | GuardError::Refresh { .. } => true,
            GuardError::Remote { code, .. } => is_fatal_code(code),
            _ => false,
        }
    }
}
