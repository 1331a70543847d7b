//! Method name and parameter shape checks.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::GuardError;

/// Largest number of commands a batch may carry.
pub const MAX_BATCH_COMMANDS: usize = 50;

fn method_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_]+(\.[a-z0-9_]+)*$").expect("Invalid method regex"))
}

/// Reject malformed method names and parameter bags.
pub fn validate_call(method: &str, params: &Value) -> Result<(), GuardError> {
    let fail = |reason: String| GuardError::Validation {
        method: method.to_string(),
        reason,
    };

    if method.len() < 3 {
        return Err(fail("method name must be at least 3 characters".into()));
    }
    if !method_re().is_match(method) {
        return Err(fail(format!(
            "method name must match {}",
            method_re().as_str()
        )));
    }
    let Value::Object(map) = params else {
        return Err(fail("params must be a JSON object".into()));
    };

    match method {
        "batch" => {
            let Some(Value::Object(cmd)) = map.get("cmd") else {
                return Err(fail("params.cmd must be an object of commands".into()));
            };
            if cmd.is_empty() || cmd.len() > MAX_BATCH_COMMANDS {
                return Err(fail(format!(
                    "params.cmd must hold 1 to {MAX_BATCH_COMMANDS} commands, got {}",
                    cmd.len()
                )));
            }
            if let Some((name, _)) = cmd.iter().find(|(_, v)| !v.is_string()) {
                return Err(fail(format!("params.cmd.{name} must be a string")));
            }
            match map.get("halt") {
                None | Some(Value::Bool(_)) => {}
                Some(Value::Number(n)) if matches!(n.as_u64(), Some(0 | 1)) => {}
                Some(_) => return Err(fail("params.halt must be a boolean or 0/1".into())),
            }
        }
        "event.offline.get" => match map.get("clear") {
            None => {}
            Some(Value::Number(n)) if matches!(n.as_u64(), Some(0 | 1)) => {}
            Some(Value::String(s)) if s == "0" || s == "1" => {}
            Some(_) => return Err(fail("params.clear must be 0/1 or \"0\"/\"1\"".into())),
        },
        _ => {}
    }
    Ok(())
}

/// Method name of a batch command string such as `crm.lead.get?id=1`.
pub fn batch_command_method(command: &str) -> String {
    command
        .split_once('?')
        .map_or(command, |(method, _)| method)
        .trim()
        .to_ascii_lowercase()
}

/// Method names of every command in a batch call, in command-name order.
pub fn batch_methods(params: &Value) -> Vec<(String, String)> {
    params
        .get("cmd")
        .and_then(Value::as_object)
        .map(|cmd| {
            cmd.iter()
                .filter_map(|(name, v)| v.as_str().map(|c| (name.clone(), batch_command_method(c))))
                .collect()
        })
        .unwrap_or_default()
}
