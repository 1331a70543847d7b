//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::policy::risk::Risk;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Remote portal and authentication mode.
    pub tenant: TenantConfig,

    /// OAuth tokens and refresh settings.
    pub credentials: CredentialsConfig,

    /// Allowlist, risk and plan policy. Hot-reloadable.
    pub policy: PolicyConfig,

    /// Token bucket admission control.
    pub rate_limit: RateLimitConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Idempotent replay of write calls.
    pub idempotency: IdempotencyConfig,

    /// Two-phase plan/execute.
    pub plans: PlanConfig,

    /// Audit journal.
    pub audit: AuditConfig,

    /// Persisted state backend.
    pub storage: StorageConfig,

    /// Offline queue worker.
    pub worker: WorkerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// How requests authenticate against the portal.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Inbound webhook: user id and code embedded in the URL.
    #[default]
    Webhook,
    /// OAuth access token sent as the `auth` parameter.
    OAuth,
}

/// Remote portal identity.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TenantConfig {
    /// Portal domain, e.g. "example.bitrix24.ru". Also the tenant key.
    pub domain: String,

    /// Authentication mode.
    pub auth_mode: AuthMode,

    /// Webhook user id (webhook mode).
    pub webhook_user_id: Option<String>,

    /// Webhook secret code (webhook mode).
    pub webhook_code: Option<String>,
}

/// OAuth credential settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Initial access token. Seeds the credential store when it is empty.
    pub access_token: Option<String>,

    /// Initial refresh token.
    pub refresh_token: Option<String>,

    /// OAuth application id.
    pub client_id: Option<String>,

    /// OAuth application secret.
    pub client_secret: Option<String>,

    /// Token endpoint for the refresh grant.
    pub token_url: String,

    /// Refresh automatically when the portal reports `expired_token`.
    pub auto_refresh: bool,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            client_id: None,
            client_secret: None,
            token_url: "https://oauth.bitrix24.tech/oauth/token/".to_string(),
            auto_refresh: false,
        }
    }
}

/// Call policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Capability packs whose patterns join the allowlist. "none" disables packs.
    pub packs: Vec<String>,

    /// Extra allowlist patterns (exact, `prefix.*` or glob).
    pub method_allowlist: Vec<String>,

    /// Risk per method, taking precedence over the naming heuristic.
    pub risk_overrides: BTreeMap<String, Risk>,

    /// Write and destructive calls must go through plan/execute.
    pub require_plan: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            packs: vec!["core".to_string()],
            method_allowlist: vec!["batch".to_string()],
            risk_overrides: BTreeMap::new(),
            require_plan: false,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Token refill rate per second.
    pub rate_per_sec: f64,

    /// Burst capacity.
    pub burst: f64,

    /// Longest a call waits for a token before failing, in milliseconds.
    pub max_wait_ms: u64,

    /// Bucket records idle longer than this are pruned.
    pub state_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_per_sec: 2.0,
            burst: 10.0,
            max_wait_ms: 30_000,
            state_ttl_secs: 3600,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Upper bound of the random jitter added to each delay.
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-attempt request timeout in seconds.
    pub request_secs: u64,

    /// Bounded wait for in-flight idempotency reservations and refreshes.
    pub lock_wait_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            lock_wait_ms: 5_000,
        }
    }
}

/// Idempotency configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Enable the idempotency layer.
    pub enabled: bool,

    /// Lifetime of completed records in seconds.
    pub ttl_secs: u64,

    /// Lifetime of in-progress reservations in seconds. The gateway raises
    /// it to the longest a call can run under the retry and timeout settings.
    pub in_flight_lease_secs: u64,

    /// Derive a key from `idempotency_key`/`origin_id`/`external_id` params
    /// when mutating calls carry no explicit key.
    pub derive_from_params: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 86_400,
            in_flight_lease_secs: 120,
            derive_from_params: false,
        }
    }
}

/// Plan store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Seconds a pending plan stays executable.
    pub ttl_secs: u64,

    /// Issue `p-1`, `p-2`, ... instead of random ids.
    pub sequential_ids: bool,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 1800,
            sequential_ids: false,
        }
    }
}

/// Audit journal configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Enable the journal.
    pub enabled: bool,

    /// JSONL file the journal appends to.
    pub path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: ".runtime/audit.jsonl".to_string(),
        }
    }
}

/// Where persisted state lives.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on exit.
    Memory,
    /// JSON documents under `state_dir`, shared across processes.
    #[default]
    File,
}

/// State storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Directory holding one JSON document per namespace.
    pub state_dir: String,

    /// Longest a file-store access waits for another process's lock.
    pub lock_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            state_dir: ".runtime/state".to_string(),
            lock_timeout_ms: 5_000,
        }
    }
}

/// Offline queue worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty, in milliseconds.
    pub poll_interval_ms: u64,

    /// Items requested per poll.
    pub batch_size: usize,

    /// Failures per event before it is dead-lettered.
    pub max_retries: u32,

    /// Consecutive failed cycles before the worker gives up.
    pub max_consecutive_errors: u32,

    /// Expected `application_token` on queued events, if validated.
    pub application_token: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            batch_size: 50,
            max_retries: 5,
            max_consecutive_errors: 10,
            application_token: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: GuardConfig = toml::from_str(
            r#"
            [tenant]
            domain = "example.bitrix24.ru"
            auth_mode = "oauth"

            [policy]
            packs = ["core", "comms"]
            risk_overrides = { "crm.lead.merge" = "destructive" }
            "#,
        )
        .unwrap();

        assert_eq!(config.tenant.auth_mode, AuthMode::OAuth);
        assert_eq!(config.policy.packs, vec!["core", "comms"]);
        assert_eq!(
            config.policy.risk_overrides.get("crm.lead.merge"),
            Some(&Risk::Destructive)
        );
        assert_eq!(config.policy.method_allowlist, vec!["batch"]);
        assert_eq!(config.retries.max_attempts, 5);
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.plans.ttl_secs, 1800);
    }
}
