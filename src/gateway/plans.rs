//! Two-phase plan/execute storage.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::digest::sha256_hex;
use crate::error::{GuardError, GuardResult};
use crate::gateway::request::CallRequest;
use crate::policy::{Admission, Risk};
use crate::store::{self, StateStore};

const NAMESPACE: &str = "plans";
const SEQUENCE_NAMESPACE: &str = "plan_sequence";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Executed,
    Expired,
}

/// A proposed call awaiting execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub tenant: String,
    pub method: String,
    pub params: Value,
    pub risk: Risk,
    pub allowlisted: bool,
    pub packs: Vec<String>,
    #[serde(default)]
    pub rest_v3: bool,
    pub created_at: f64,
    pub expires_at: f64,
    pub status: PlanStatus,
    #[serde(default)]
    pub executed_at: Option<f64>,
}

/// Persists plans and hands each one out for execution at most once.
pub struct PlanStore {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    sequential_ids: bool,
}

impl PlanStore {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        sequential_ids: bool,
    ) -> Self {
        Self {
            store,
            clock,
            ttl,
            sequential_ids,
        }
    }

    /// Persist a new pending plan for an admitted request.
    pub fn create(
        &self,
        tenant: &str,
        request: &CallRequest,
        admission: Admission,
        packs: &[String],
    ) -> GuardResult<Plan> {
        let now = self.clock.now();
        let plan = Plan {
            plan_id: self.next_id(tenant, request, admission.risk, now)?,
            tenant: tenant.to_string(),
            method: request.method().to_string(),
            params: request.params().clone(),
            risk: admission.risk,
            allowlisted: admission.allowlisted,
            packs: packs.to_vec(),
            rest_v3: request.rest_v3(),
            created_at: now,
            expires_at: now + self.ttl.as_secs_f64(),
            status: PlanStatus::Pending,
            executed_at: None,
        };

        self.prune(now);
        store::mutate_as::<Plan, ()>(self.store.as_ref(), NAMESPACE, &plan.plan_id, |slot| {
            *slot = Some(plan.clone());
        })?;
        tracing::info!(plan_id = %plan.plan_id, method = %plan.method, risk = %plan.risk, "Plan created");
        Ok(plan)
    }

    pub fn get(&self, plan_id: &str) -> GuardResult<Option<Plan>> {
        Ok(store::get_as(self.store.as_ref(), NAMESPACE, plan_id)?)
    }

    /// Atomically move a pending plan to executed and return it.
    ///
    /// Concurrent claims serialize on the plan's key lock; exactly one wins.
    pub fn claim(&self, plan_id: &str, tenant: &str) -> GuardResult<Plan> {
        let now = self.clock.now();
        store::mutate_as::<Plan, GuardResult<Plan>>(
            self.store.as_ref(),
            NAMESPACE,
            plan_id,
            |slot| {
                let Some(plan) = slot.as_mut() else {
                    return Err(GuardError::PlanNotFound(plan_id.to_string()));
                };
                if plan.tenant != tenant {
                    return Err(GuardError::Policy {
                        method: plan.method.clone(),
                        reason: "plan tenant mismatch".to_string(),
                    });
                }
                match plan.status {
                    PlanStatus::Executed => Err(GuardError::PlanAlreadyExecuted(plan_id.to_string())),
                    PlanStatus::Expired => Err(GuardError::PlanExpired(plan_id.to_string())),
                    PlanStatus::Pending if now > plan.expires_at => {
                        plan.status = PlanStatus::Expired;
                        Err(GuardError::PlanExpired(plan_id.to_string()))
                    }
                    PlanStatus::Pending => {
                        plan.status = PlanStatus::Executed;
                        plan.executed_at = Some(now);
                        Ok(plan.clone())
                    }
                }
            },
        )?
    }

    fn next_id(&self, tenant: &str, request: &CallRequest, risk: Risk, now: f64) -> GuardResult<String> {
        if self.sequential_ids {
            let n = store::mutate_as::<u64, u64>(
                self.store.as_ref(),
                SEQUENCE_NAMESPACE,
                "next",
                |slot| {
                    let next = slot.unwrap_or(0) + 1;
                    *slot = Some(next);
                    next
                },
            )?;
            return Ok(format!("p-{n}"));
        }
        let seed = format!(
            "{tenant}|{}|{risk}|{}|{now}|{}",
            request.method(),
            request.params(),
            uuid::Uuid::new_v4()
        );
        let mut id = sha256_hex(seed.as_bytes());
        id.truncate(20);
        Ok(id)
    }

    /// Forget plans whose expiry passed more than one TTL ago.
    fn prune(&self, now: f64) {
        let grace = self.ttl.as_secs_f64();
        let pruned = self.store.retain(NAMESPACE, &mut |_, value| {
            value
                .get("expires_at")
                .and_then(Value::as_f64)
                .is_some_and(|expires_at| expires_at + grace > now)
        });
        if let Err(e) = pruned {
            tracing::warn!(error = %e, "Failed to prune plans");
        }
    }
}
