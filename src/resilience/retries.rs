//! Retry logic.
//!
//! # Responsibilities
//! - Classify every failed attempt (transient, auth-expired, non-retryable)
//! - Retry transient failures with exponential backoff + jitter
//! - Refresh credentials once on expiry and retry exactly once more
//!
//! # Design Decisions
//! - Retries happen only here; the transport makes one exchange per call
//! - Sleeping goes through the injected clock so tests never wait
//! - Exhaustion surfaces the last remote error with the retry count

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::api::types::{ApiError, ErrorClass};
use crate::auth::{Credential, CredentialStore, RefreshCoordinator};
use crate::clock::Clock;
use crate::config::schema::RetryConfig;
use crate::error::{GuardError, GuardResult};
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::timeouts::with_timeout;

/// Bounds for transient retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_ms: config.jitter_ms,
        }
    }
}

impl RetryPolicy {
    /// Total backoff slept by a call that exhausts every attempt, with the
    /// jitter at its maximum.
    pub fn worst_case_backoff(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| {
                calculate_backoff(attempt, self.base_delay_ms, self.max_delay_ms, 0)
                    + Duration::from_millis(self.jitter_ms)
            })
            .sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// A successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub payload: Value,
    /// Attempts beyond the first.
    pub retries: u32,
    pub attempts: u32,
}

/// Runs a network call under the retry policy.
pub struct RetryExecutor {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    tenant: String,
    call_timeout: Duration,
    credentials: Option<CredentialStore>,
    refresh: Option<Arc<RefreshCoordinator>>,
}

impl RetryExecutor {
    pub fn new(
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        tenant: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            clock,
            tenant: tenant.into(),
            call_timeout,
            credentials: None,
            refresh: None,
        }
    }

    /// Attach stored OAuth credentials to every attempt.
    pub fn with_credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Refresh expired credentials through `coordinator`.
    pub fn with_refresh(mut self, coordinator: Arc<RefreshCoordinator>) -> Self {
        self.credentials = Some(coordinator.credentials().clone());
        self.refresh = Some(coordinator);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Call `attempt` until it succeeds or the failure is final.
    ///
    /// `attempt` receives the credential to use, `None` in webhook mode.
    pub async fn invoke<F, Fut>(&self, method: &str, mut attempt: F) -> GuardResult<Invocation>
    where
        F: FnMut(Option<Credential>) -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let mut credential = self.load_credential()?;
        let mut refreshed = false;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let err = match with_timeout(self.call_timeout, attempt(credential.clone())).await {
                Ok(payload) => {
                    return Ok(Invocation {
                        payload,
                        retries: attempts - 1,
                        attempts,
                    })
                }
                Err(err) => err,
            };

            match err.class() {
                ErrorClass::NonRetryable => {
                    tracing::debug!(method, code = %err.code, attempts, "Non-retryable error");
                    return Err(GuardError::Remote {
                        method: method.to_string(),
                        code: err.code,
                        status: err.status,
                        message: err.message,
                        attempts,
                    });
                }
                ErrorClass::AuthExpired => {
                    let Some(refresh) = self.refresh.as_ref().filter(|_| !refreshed) else {
                        tracing::warn!(method, attempts, "Credentials expired");
                        return Err(GuardError::AuthExpired {
                            method: method.to_string(),
                            attempts,
                        });
                    };
                    refreshed = true;
                    metrics::record_retry(method, &err.code);
                    let fresh = refresh
                        .refresh_if_needed(&self.tenant, credential.as_ref())
                        .await?;
                    credential = Some(fresh);
                }
                ErrorClass::Transient => {
                    if attempts >= self.policy.max_attempts {
                        tracing::warn!(method, code = %err.code, attempts, "Retries exhausted");
                        return Err(GuardError::TransientServer {
                            method: method.to_string(),
                            retries: attempts - 1,
                            code: err.code,
                            message: err.message,
                        });
                    }
                    let delay = calculate_backoff(
                        attempts,
                        self.policy.base_delay_ms,
                        self.policy.max_delay_ms,
                        self.policy.jitter_ms,
                    );
                    metrics::record_retry(method, &err.code);
                    tracing::info!(
                        method,
                        code = %err.code,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient error, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
            }
        }
    }

    fn load_credential(&self) -> GuardResult<Option<Credential>> {
        match &self.credentials {
            Some(store) => Ok(store.load(&self.tenant)?),
            None => Ok(None),
        }
    }
}
