//! Call policy subsystem.
//!
//! # Data Flow
//! ```text
//! CallRequest
//!     → validation.rs (method name, params shape, batch/offline schemas)
//!     → allowlist.rs (packs + explicit patterns, batch commands one by one)
//!     → risk.rs (overrides, naming heuristic, batch max)
//!     → plan requirement and confirmation flags
//!     → Admission { risk, allowlisted }
//! ```
//!
//! # Design Decisions
//! - Every rejection happens before any state is touched or network is used
//! - A declared risk can only raise the resolved risk, never lower it
//! - Policy is immutable; reloads build a new one and swap it in

pub mod allowlist;
pub mod risk;
pub mod validation;

use std::collections::BTreeMap;

use crate::config::schema::PolicyConfig;
use crate::error::GuardError;
use crate::gateway::request::CallRequest;

pub use allowlist::{parse_pack_list, Allowlist, MethodMatcher, UnknownPack};
pub use risk::Risk;

/// Which checks apply to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Creating a plan: no confirmations or plan requirement yet.
    Plan,
    /// Direct execution: every check.
    Execute,
    /// Executing a stored plan: the plan requirement is already met.
    ExecutePlan,
    /// Internal queue protocol calls: the plan requirement does not apply.
    Protocol,
}

/// Outcome of a successful policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub risk: Risk,
    /// False when admitted only through allow-unlisted.
    pub allowlisted: bool,
}

/// Compiled call policy.
#[derive(Debug, Clone)]
pub struct Policy {
    packs: Vec<String>,
    allowlist: Allowlist,
    risk_overrides: BTreeMap<String, Risk>,
    require_plan: bool,
}

impl Policy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self, UnknownPack> {
        let packs = parse_pack_list(&config.packs)?;
        let allowlist = Allowlist::build(&config.method_allowlist, &packs);
        let risk_overrides = config
            .risk_overrides
            .iter()
            .map(|(method, risk)| (method.trim().to_ascii_lowercase(), *risk))
            .collect();
        Ok(Self {
            packs,
            allowlist,
            risk_overrides,
            require_plan: config.require_plan,
        })
    }

    pub fn packs(&self) -> &[String] {
        &self.packs
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    pub fn require_plan(&self) -> bool {
        self.require_plan
    }

    /// Effective risk: the stricter of the declared and the resolved risk.
    pub fn effective_risk(&self, request: &CallRequest) -> Risk {
        let resolved = risk::resolve_risk(request.method(), request.params(), &self.risk_overrides);
        request.risk().map_or(resolved, |declared| declared.max(resolved))
    }

    /// Run every check that applies at `stage`.
    pub fn admit(&self, request: &CallRequest, stage: Stage) -> Result<Admission, GuardError> {
        let method = request.method();
        validation::validate_call(method, request.params())?;

        let allowlisted = self.allowlist.allows(method);
        if !allowlisted && !request.allow_unlisted() {
            return Err(policy_error(
                method,
                "method is outside allowlist; extend packs/method_allowlist or allow unlisted",
            ));
        }
        if method == "batch" && !request.allow_unlisted() {
            for (name, command) in validation::batch_methods(request.params()) {
                if !self.allowlist.allows(&command) {
                    return Err(policy_error(
                        method,
                        &format!("batch command '{name}' uses non-allowlisted method '{command}'"),
                    ));
                }
            }
        }

        let risk = self.effective_risk(request);
        if stage == Stage::Execute && self.require_plan && risk.is_mutating() {
            return Err(policy_error(
                method,
                "plan is required for write/destructive operations; create a plan and execute it",
            ));
        }
        if stage != Stage::Plan {
            if risk == Risk::Write && !request.confirm_write() {
                return Err(policy_error(method, "write method requires write confirmation"));
            }
            if risk == Risk::Destructive && !request.confirm_destructive() {
                return Err(policy_error(
                    method,
                    "destructive method requires destructive confirmation",
                ));
            }
        }

        Ok(Admission { risk, allowlisted })
    }
}

fn policy_error(method: &str, reason: &str) -> GuardError {
    GuardError::Policy {
        method: method.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(require_plan: bool) -> Policy {
        Policy::from_config(&PolicyConfig {
            require_plan,
            ..PolicyConfig::default()
        })
        .unwrap()
    }

    fn reason(result: Result<Admission, GuardError>) -> String {
        match result {
            Err(GuardError::Policy { reason, .. }) => reason,
            other => panic!("expected policy error, got {other:?}"),
        }
    }

    #[test]
    fn test_confirmations() {
        let policy = policy(false);
        let add = CallRequest::builder("crm.lead.add").params(json!({"fields": {}})).build();
        assert!(reason(policy.admit(&add, Stage::Execute)).contains("write confirmation"));

        let confirmed = CallRequest::builder("crm.lead.add").confirm_write(true).build();
        let admission = policy.admit(&confirmed, Stage::Execute).unwrap();
        assert_eq!(admission.risk, Risk::Write);

        let delete = CallRequest::builder("crm.lead.delete").confirm_write(true).build();
        assert!(reason(policy.admit(&delete, Stage::Execute)).contains("destructive"));

        // Plans are created without confirmation.
        assert!(policy.admit(&add, Stage::Plan).is_ok());
    }

    #[test]
    fn test_allowlist_and_unlisted() {
        let policy = policy(false);
        let im = CallRequest::builder("im.message.add").confirm_write(true).build();
        assert!(reason(policy.admit(&im, Stage::Execute)).contains("outside allowlist"));

        let unlisted = CallRequest::builder("im.message.add")
            .confirm_write(true)
            .allow_unlisted(true)
            .build();
        let admission = policy.admit(&unlisted, Stage::Execute).unwrap();
        assert!(!admission.allowlisted);
    }

    #[test]
    fn test_batch_commands_checked_individually() {
        let policy = policy(false);
        let batch = CallRequest::builder("batch")
            .params(json!({"cmd": {"a": "user.current", "b": "disk.folder.get?id=1"}}))
            .build();
        assert!(reason(policy.admit(&batch, Stage::Execute)).contains("'disk.folder.get'"));

        let batch = CallRequest::builder("batch")
            .params(json!({"cmd": {"a": "crm.lead.delete?id=1"}}))
            .confirm_write(true)
            .build();
        assert!(reason(policy.admit(&batch, Stage::Execute)).contains("destructive"));
    }

    #[test]
    fn test_require_plan() {
        let policy = policy(true);
        let add = CallRequest::builder("crm.lead.add").confirm_write(true).build();
        assert!(reason(policy.admit(&add, Stage::Execute)).contains("plan is required"));
        assert!(policy.admit(&add, Stage::ExecutePlan).is_ok());
        assert!(policy.admit(&add, Stage::Protocol).is_ok());

        let read = CallRequest::builder("crm.lead.list").build();
        assert!(policy.admit(&read, Stage::Execute).is_ok());
    }

    #[test]
    fn test_declared_risk_only_tightens() {
        let policy = policy(false);
        let lowered = CallRequest::builder("crm.lead.delete").risk(Risk::Read).build();
        assert_eq!(policy.effective_risk(&lowered), Risk::Destructive);

        let raised = CallRequest::builder("crm.lead.get").risk(Risk::Write).build();
        assert_eq!(policy.effective_risk(&raised), Risk::Write);
    }

    #[test]
    fn test_validation_runs_first() {
        let policy = policy(false);
        let bad = CallRequest::builder("crm.lead.list").params(json!("nope")).build();
        assert!(matches!(
            policy.admit(&bad, Stage::Execute),
            Err(GuardError::Validation { .. })
        ));
    }
}
