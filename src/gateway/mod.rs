//! Policy gateway.
//!
//! # Data Flow
//! ```text
//! CallRequest
//!     → Policy::admit (validation, allowlist, risk, confirmations)
//!     → idempotency.rs (replay, conflict, or reserve the key)
//!     → RateLimiter (per-tenant token, bounded wait)
//!     → RetryExecutor → Transport
//!     → idempotency.rs (store result or release reservation)
//!     → audit.rs (exactly one entry per call)
//! ```
//!
//! Plans go through `plan` (admitted without confirmations, persisted) and
//! later `execute_plan`, which claims the plan once and runs the stored call.
//!
//! # Design Decisions
//! - Rejections never touch the network, the limiter or the idempotency store
//! - The policy is swapped atomically; in-flight calls keep the one they loaded
//! - Audit failures are logged and counted but never fail a call

pub mod audit;
pub mod idempotency;
pub mod plans;
pub mod request;

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde_json::Value;

use crate::api::{HttpTransport, RemoteCall, Transport};
use crate::auth::{Credential, CredentialStore, OAuthRefresher, RefreshCoordinator, Refresher};
use crate::clock::{Clock, SystemClock};
use crate::config::loader::ConfigError;
use crate::config::schema::{AuthMode, GuardConfig, PolicyConfig};
use crate::config::validation::ValidationError;
use crate::digest::{param_keys, params_digest};
use crate::error::{GuardError, GuardResult};
use crate::observability::metrics;
use crate::policy::{Policy, Risk, Stage};
use crate::resilience::timeouts::call_budget;
use crate::resilience::{Invocation, RetryExecutor, RetryPolicy};
use crate::security::RateLimiter;
use crate::store::{self, StateStore};

pub use audit::{AuditEntry, AuditLogger, AuditSink, FileAuditSink, MemoryAuditSink, Outcome};
pub use idempotency::{IdempotencyStore, Reservation};
pub use plans::{Plan, PlanStatus, PlanStore};
pub use request::{CallRequest, CallRequestBuilder};

const IN_FLIGHT_POLL: Duration = Duration::from_millis(100);

/// Result of a successful gateway call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub payload: Value,
    pub retries: u32,
    /// Served from the idempotency store without a network call.
    pub replayed: bool,
    pub risk: Risk,
    pub request_id: String,
    pub idempotency_key: Option<String>,
}

/// Flags supplied when a stored plan is executed.
///
/// The plan is claimed before these confirmations are checked, so executing
/// without the confirmation the plan's risk needs still consumes it. Only an
/// `expected_method` mismatch is rejected before the claim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanExecution {
    pub confirm_write: bool,
    pub confirm_destructive: bool,
    pub allow_unlisted: bool,
    pub idempotency_key: Option<String>,
    /// When set, must equal the planned method.
    pub expected_method: Option<String>,
}

/// Per-call bookkeeping that ends up in the audit entry.
struct CallContext {
    request_id: String,
    started: Instant,
    risk: Risk,
    allowlisted: bool,
    idempotency_key: Option<String>,
    plan_id: Option<String>,
}

/// Policy-gated executor for remote API calls.
pub struct PolicyGateway {
    tenant: String,
    policy: ArcSwap<Policy>,
    transport: Arc<dyn Transport>,
    limiter: RateLimiter,
    executor: RetryExecutor,
    idempotency: Option<IdempotencyStore>,
    plans: PlanStore,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    max_wait: Duration,
    lock_wait: Duration,
    derive_keys: bool,
}

impl PolicyGateway {
    pub fn builder(config: GuardConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The policy currently in force.
    pub fn policy(&self) -> Arc<Policy> {
        self.policy.load_full()
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn plans(&self) -> &PlanStore {
        &self.plans
    }

    /// Build a policy from `config` and swap it in. The old policy stays
    /// when the new one is invalid.
    pub fn reload_policy(&self, config: &PolicyConfig) -> GuardResult<()> {
        let policy = Policy::from_config(config).map_err(|e| {
            ConfigError::Validation(vec![ValidationError::new("policy.packs", e.to_string())])
        })?;
        tracing::info!(
            packs = ?policy.packs(),
            require_plan = policy.require_plan(),
            "Policy reloaded"
        );
        self.policy.store(Arc::new(policy));
        Ok(())
    }

    /// Run a call directly.
    pub async fn execute(&self, request: CallRequest) -> GuardResult<CallOutcome> {
        self.run(request, Stage::Execute, None).await
    }

    /// Run an internal protocol call, exempt from the plan requirement.
    pub async fn execute_protocol(&self, request: CallRequest) -> GuardResult<CallOutcome> {
        self.run(request, Stage::Protocol, None).await
    }

    /// Admit a call without confirmations and persist it as a pending plan.
    pub async fn plan(&self, request: CallRequest) -> GuardResult<Plan> {
        let policy = self.policy.load_full();
        let admission = policy.admit(&request, Stage::Plan)?;
        self.plans.create(&self.tenant, &request, admission, policy.packs())
    }

    /// Claim a pending plan and run its call with the given confirmations.
    ///
    /// A claimed plan is consumed even when the call then fails.
    pub async fn execute_plan(
        &self,
        plan_id: &str,
        execution: PlanExecution,
    ) -> GuardResult<CallOutcome> {
        let plan_id = plan_id.trim();
        if let Some(expected) = execution.expected_method.as_deref() {
            let expected = expected.trim().to_ascii_lowercase();
            let stored = self
                .plans
                .get(plan_id)?
                .ok_or_else(|| GuardError::PlanNotFound(plan_id.to_string()))?;
            if !expected.is_empty() && expected != stored.method {
                return Err(GuardError::Policy {
                    method: expected,
                    reason: format!("does not match planned method '{}'", stored.method),
                });
            }
        }

        let plan = self.plans.claim(plan_id, &self.tenant)?;
        tracing::info!(plan_id, method = %plan.method, "Executing plan");

        let mut builder = CallRequest::builder(&plan.method)
            .params(plan.params.clone())
            .risk(plan.risk)
            .rest_v3(plan.rest_v3)
            .confirm_write(execution.confirm_write)
            .confirm_destructive(execution.confirm_destructive)
            .allow_unlisted(execution.allow_unlisted);
        if let Some(key) = execution.idempotency_key {
            builder = builder.idempotency_key(key);
        }
        self.run(builder.build(), Stage::ExecutePlan, Some(plan.plan_id))
            .await
    }

    async fn run(
        &self,
        request: CallRequest,
        stage: Stage,
        plan_id: Option<String>,
    ) -> GuardResult<CallOutcome> {
        let policy = self.policy.load_full();
        let mut ctx = CallContext {
            request_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
            risk: policy.effective_risk(&request),
            allowlisted: policy.allowlist().allows(request.method()),
            idempotency_key: None,
            plan_id,
        };

        let result = self.dispatch(&policy, &request, stage, &mut ctx).await;

        let elapsed = ctx.started.elapsed();
        let outcome = match &result {
            Ok(done) if done.replayed => Outcome::Replayed,
            Ok(_) => Outcome::Ok,
            Err(_) => Outcome::Error,
        };
        self.audit.record(&self.audit_entry(&request, &ctx, outcome, &result, elapsed));
        metrics::record_call(request.method(), outcome_label(outcome), elapsed);

        match &result {
            Ok(done) => tracing::info!(
                request_id = %ctx.request_id,
                method = request.method(),
                retries = done.retries,
                replayed = done.replayed,
                latency_ms = elapsed.as_millis() as u64,
                "Call completed"
            ),
            Err(e) => tracing::warn!(
                request_id = %ctx.request_id,
                method = request.method(),
                kind = e.kind(),
                error = %e,
                "Call failed"
            ),
        }
        result
    }

    async fn dispatch(
        &self,
        policy: &Policy,
        request: &CallRequest,
        stage: Stage,
        ctx: &mut CallContext,
    ) -> GuardResult<CallOutcome> {
        let admission = policy.admit(request, stage)?;
        ctx.risk = admission.risk;
        ctx.allowlisted = admission.allowlisted;
        ctx.idempotency_key = self.idempotency_key_for(request, admission.risk);

        let outcome = |payload: Value, retries: u32, replayed: bool| CallOutcome {
            payload,
            retries,
            replayed,
            risk: admission.risk,
            request_id: ctx.request_id.clone(),
            idempotency_key: ctx.idempotency_key.clone(),
        };

        let (Some(store), Some(key)) = (&self.idempotency, ctx.idempotency_key.as_deref()) else {
            let invocation = self.invoke(request).await?;
            return Ok(outcome(invocation.payload, invocation.retries, false));
        };

        let method = request.method();
        let digest = params_digest(request.params());
        if let Some(stored) = self.reserve(store, method, key, &digest).await? {
            tracing::debug!(method, key, "Replaying stored result");
            return Ok(outcome(stored, 0, true));
        }

        match self.invoke(request).await {
            Ok(invocation) => {
                let stored = store.put(method, key, &digest, &invocation.payload)?;
                Ok(outcome(stored, invocation.retries, false))
            }
            Err(e) => {
                if let Err(release) = store.release(method, key) {
                    tracing::warn!(method, key, error = %release, "Failed to release idempotency key");
                }
                Err(e)
            }
        }
    }

    /// Reserve `key`, waiting a bounded time for another holder to finish.
    /// Returns the stored result when this call is a replay.
    async fn reserve(
        &self,
        store: &IdempotencyStore,
        method: &str,
        key: &str,
        digest: &str,
    ) -> GuardResult<Option<Value>> {
        let deadline = self.clock.now() + self.lock_wait.as_secs_f64();
        loop {
            match store.reserve(method, key, digest)? {
                Reservation::Acquired => return Ok(None),
                Reservation::Replay(stored) => return Ok(Some(stored)),
                Reservation::InFlight if self.clock.now() >= deadline => {
                    return Err(GuardError::IdempotencyConflict {
                        method: method.to_string(),
                        key: key.to_string(),
                        reason: "another call with this key is still in flight".to_string(),
                    });
                }
                Reservation::InFlight => self.clock.sleep(IN_FLIGHT_POLL).await,
            }
        }
    }

    async fn invoke(&self, request: &CallRequest) -> GuardResult<Invocation> {
        self.limiter.acquire(&self.tenant, 1.0, self.max_wait).await?;

        let method = request.method();
        self.executor
            .invoke(method, |credential: Option<Credential>| {
                let transport = self.transport.clone();
                let call = RemoteCall {
                    method: method.to_string(),
                    params: request.params().clone(),
                    rest_v3: request.rest_v3(),
                    credential,
                };
                async move { transport.call(&call).await }
            })
            .await
    }

    /// Explicit keys always apply; derived keys only for mutating calls.
    fn idempotency_key_for(&self, request: &CallRequest, risk: Risk) -> Option<String> {
        self.idempotency.as_ref()?;
        if let Some(key) = request.idempotency_key() {
            return Some(key.to_string());
        }
        if self.derive_keys && risk.is_mutating() {
            return idempotency::derive_key(request.params());
        }
        None
    }

    fn audit_entry(
        &self,
        request: &CallRequest,
        ctx: &CallContext,
        outcome: Outcome,
        result: &GuardResult<CallOutcome>,
        elapsed: Duration,
    ) -> AuditEntry {
        let (retries, error_code, error_message) = match result {
            Ok(done) => (done.retries, None, None),
            Err(e) => (
                e.retries(),
                Some(e.remote_code().unwrap_or(e.kind()).to_string()),
                Some(crate::security::mask_secrets(&e.to_string())),
            ),
        };
        AuditEntry {
            ts: self.clock.now(),
            request_id: ctx.request_id.clone(),
            tenant: self.tenant.clone(),
            method: request.method().to_string(),
            risk: ctx.risk,
            outcome,
            error_code,
            error_message,
            params_digest: params_digest(request.params()),
            param_keys: param_keys(request.params()),
            latency_ms: elapsed.as_millis() as u64,
            retries,
            allowlisted: ctx.allowlisted,
            rest_v3: request.rest_v3(),
            plan_id: ctx.plan_id.clone(),
            idempotency_key: ctx.idempotency_key.clone(),
        }
    }
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Ok => "ok",
        Outcome::Error => "error",
        Outcome::Replayed => "replayed",
    }
}

/// Tenant identity derived from the portal domain.
pub fn tenant_key(domain: &str) -> String {
    let domain = domain.trim().to_ascii_lowercase();
    let domain = domain
        .strip_prefix("https://")
        .or_else(|| domain.strip_prefix("http://"))
        .unwrap_or(&domain);
    domain.trim_end_matches('/').to_string()
}

/// Assembles a [`PolicyGateway`] from configuration plus optional
/// replacements for its collaborators.
pub struct GatewayBuilder {
    config: GuardConfig,
    store: Option<Arc<dyn StateStore>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    refresher: Option<Arc<dyn Refresher>>,
}

impl GatewayBuilder {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            clock: None,
            audit_sink: None,
            refresher: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the configured audit destination. Ignored when auditing is
    /// disabled.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn Refresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn build(self) -> GuardResult<PolicyGateway> {
        let config = self.config;
        let tenant = tenant_key(&config.tenant.domain);
        let store = self.store.unwrap_or_else(|| store::open(&config.storage));
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let call_timeout = Duration::from_secs(config.timeouts.request_secs);
        let lock_wait = Duration::from_millis(config.timeouts.lock_wait_ms);

        let policy = Policy::from_config(&config.policy).map_err(|e| {
            ConfigError::Validation(vec![ValidationError::new("policy.packs", e.to_string())])
        })?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(config.tenant.clone(), call_timeout)
                    .map_err(|e| invalid("tenant", e.to_string()))?,
            ),
        };

        let retry_policy = RetryPolicy::from(&config.retries);
        let max_wait = Duration::from_millis(config.rate_limit.max_wait_ms);
        let mut executor = RetryExecutor::new(
            retry_policy,
            clock.clone(),
            tenant.clone(),
            call_timeout,
        );
        if config.tenant.auth_mode == AuthMode::OAuth {
            let credentials = CredentialStore::new(store.clone());
            if let Some(access) = config.credentials.access_token.as_deref().filter(|s| !s.is_empty()) {
                let seed = Credential::new(access, config.credentials.refresh_token.clone());
                credentials.seed(&tenant, &seed)?;
            }
            let refresher = match self.refresher {
                Some(refresher) => Some(refresher),
                None if config.credentials.auto_refresh => Some(Arc::new(
                    OAuthRefresher::from_config(&config.credentials, call_timeout)
                        .map_err(|e| invalid("credentials", e.to_string()))?,
                ) as Arc<dyn Refresher>),
                None => None,
            };
            executor = match refresher {
                Some(refresher) => executor.with_refresh(Arc::new(RefreshCoordinator::new(
                    store.clone(),
                    refresher,
                    clock.clone(),
                    lock_wait,
                ))),
                None => executor.with_credentials(credentials),
            };
        }

        // A reservation must outlive the slowest call holding it.
        let in_flight_lease = Duration::from_secs(config.idempotency.in_flight_lease_secs)
            .max(call_budget(max_wait, &retry_policy, call_timeout, lock_wait));
        let idempotency = config.idempotency.enabled.then(|| {
            IdempotencyStore::new(
                store.clone(),
                clock.clone(),
                tenant.clone(),
                Duration::from_secs(config.idempotency.ttl_secs),
                in_flight_lease,
            )
        });

        let audit = if !config.audit.enabled {
            AuditLogger::disabled()
        } else {
            let sink: Arc<dyn AuditSink> = match self.audit_sink {
                Some(sink) => sink,
                None => Arc::new(FileAuditSink::new(&config.audit.path)),
            };
            AuditLogger::new(sink)
        };

        tracing::debug!(
            tenant = %tenant,
            packs = ?policy.packs(),
            auth_mode = ?config.tenant.auth_mode,
            "Gateway ready"
        );

        Ok(PolicyGateway {
            limiter: RateLimiter::new(store.clone(), clock.clone(), &config.rate_limit),
            plans: PlanStore::new(
                store.clone(),
                clock.clone(),
                Duration::from_secs(config.plans.ttl_secs),
                config.plans.sequential_ids,
            ),
            policy: ArcSwap::from_pointee(policy),
            max_wait,
            derive_keys: config.idempotency.derive_from_params,
            tenant,
            transport,
            executor,
            idempotency,
            audit,
            clock,
            lock_wait,
        })
    }
}

fn invalid(field: &str, message: String) -> GuardError {
    GuardError::Config(ConfigError::Validation(vec![ValidationError::new(field, message)]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_key() {
        assert_eq!(tenant_key("https://Portal.Bitrix24.ru/"), "portal.bitrix24.ru");
        assert_eq!(tenant_key("portal.bitrix24.ru"), "portal.bitrix24.ru");
        assert_eq!(tenant_key(" http://x.test "), "x.test");
    }
}
