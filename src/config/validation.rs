//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every referenced capability pack exists
//! - Validate value ranges (rates > 0, attempts >= 1)
//! - Check auth-mode specific requirements
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GuardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::{AuthMode, GuardConfig};
use crate::policy::allowlist::parse_pack_list;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.tenant.domain.trim().is_empty() {
        errors.push(ValidationError::new("tenant.domain", "must not be empty"));
    }
    if config.tenant.auth_mode == AuthMode::Webhook
        && (is_blank(&config.tenant.webhook_user_id) || is_blank(&config.tenant.webhook_code))
    {
        errors.push(ValidationError::new(
            "tenant.webhook_code",
            "webhook mode requires webhook_user_id and webhook_code",
        ));
    }
    if config.tenant.auth_mode == AuthMode::OAuth && config.credentials.auto_refresh {
        if is_blank(&config.credentials.client_id) || is_blank(&config.credentials.client_secret) {
            errors.push(ValidationError::new(
                "credentials.client_id",
                "auto_refresh requires client_id and client_secret",
            ));
        }
    }

    if let Err(e) = parse_pack_list(&config.policy.packs) {
        errors.push(ValidationError::new("policy.packs", e.to_string()));
    }
    for pattern in &config.policy.method_allowlist {
        if pattern.trim().is_empty() {
            errors.push(ValidationError::new(
                "policy.method_allowlist",
                "patterns must not be empty",
            ));
        }
    }

    if config.rate_limit.enabled {
        if !(config.rate_limit.rate_per_sec > 0.0) {
            errors.push(ValidationError::new("rate_limit.rate_per_sec", "must be > 0"));
        }
        if !(config.rate_limit.burst >= 1.0) {
            errors.push(ValidationError::new("rate_limit.burst", "must be >= 1"));
        }
    }

    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be >= 1"));
    }
    if config.retries.base_delay_ms > config.retries.max_delay_ms {
        errors.push(ValidationError::new(
            "retries.base_delay_ms",
            "must not exceed retries.max_delay_ms",
        ));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be > 0"));
    }
    if config.plans.ttl_secs == 0 {
        errors.push(ValidationError::new("plans.ttl_secs", "must be > 0"));
    }
    if config.idempotency.ttl_secs == 0 {
        errors.push(ValidationError::new("idempotency.ttl_secs", "must be > 0"));
    }
    if config.audit.enabled && config.audit.path.trim().is_empty() {
        errors.push(ValidationError::new("audit.path", "must not be empty when audit is enabled"));
    }
    if config.worker.batch_size == 0 {
        errors.push(ValidationError::new("worker.batch_size", "must be > 0"));
    }
    if config.worker.max_retries == 0 {
        errors.push(ValidationError::new("worker.max_retries", "must be >= 1"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
