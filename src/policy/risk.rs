//! Risk classification of methods.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::validation::batch_methods;

/// Side-effect class of a call. Ordered from harmless to irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Read,
    Write,
    Destructive,
}

impl Risk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Risk::Read => "read",
            Risk::Write => "write",
            Risk::Destructive => "destructive",
        }
    }

    /// Write or destructive.
    pub fn is_mutating(&self) -> bool {
        *self != Risk::Read
    }
}

impl fmt::Display for Risk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DESTRUCTIVE_VERBS: &[&str] = &[
    "delete",
    "remove",
    "recyclebin",
    "unregister",
    "unbind",
    "kill",
    "terminate",
];

const WRITE_VERBS: &[&str] = &[
    "add", "update", "set", "register", "bind", "import", "complete", "start", "stop", "move",
    "clear",
];

/// Classify a method by the verb in its last segment.
pub fn classify_method_risk(method: &str) -> Risk {
    let method = method.to_ascii_lowercase();
    let verb = method.rsplit('.').next().unwrap_or_default();
    if DESTRUCTIVE_VERBS.contains(&verb) {
        Risk::Destructive
    } else if WRITE_VERBS.contains(&verb) {
        Risk::Write
    } else {
        Risk::Read
    }
}

/// Resolve the risk of a call: explicit overrides first, then the naming
/// heuristic. A batch is as risky as its riskiest command.
pub fn resolve_risk(method: &str, params: &Value, overrides: &BTreeMap<String, Risk>) -> Risk {
    let single = |m: &str| {
        overrides
            .get(m)
            .copied()
            .unwrap_or_else(|| classify_method_risk(m))
    };

    if method == "batch" && !overrides.contains_key(method) {
        return batch_methods(params)
            .iter()
            .map(|(_, m)| single(m))
            .max()
            .unwrap_or(Risk::Read);
    }
    single(method)
}
