//! Configuration loading from disk and environment.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::{AuthMode, GuardConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value {value:?} for {var}")]
    Override { var: String, value: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load configuration from an optional TOML file, apply `GUARD_*`
/// environment overrides and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<GuardConfig, ConfigError> {
    let config = match path {
        Some(path) => parse_file(path)?,
        None => GuardConfig::default(),
    };
    let config = apply_env_overrides(config, |var| std::env::var(var).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Parse a TOML file without overrides or validation.
pub fn parse_file(path: &Path) -> Result<GuardConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Overlay environment variables onto a configuration.
///
/// `lookup` resolves a variable name; empty values are ignored.
pub fn apply_env_overrides(
    mut config: GuardConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<GuardConfig, ConfigError> {
    let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(domain) = get("GUARD_DOMAIN") {
        config.tenant.domain = domain;
    }
    if let Some(mode) = get("GUARD_AUTH_MODE") {
        config.tenant.auth_mode = match mode.to_ascii_lowercase().as_str() {
            "webhook" => AuthMode::Webhook,
            "oauth" => AuthMode::OAuth,
            _ => return Err(invalid("GUARD_AUTH_MODE", &mode)),
        };
    }
    if let Some(user) = get("GUARD_WEBHOOK_USER_ID") {
        config.tenant.webhook_user_id = Some(user);
    }
    if let Some(code) = get("GUARD_WEBHOOK_CODE") {
        config.tenant.webhook_code = Some(code);
    }
    if let Some(token) = get("GUARD_ACCESS_TOKEN") {
        config.credentials.access_token = Some(token);
    }
    if let Some(token) = get("GUARD_REFRESH_TOKEN") {
        config.credentials.refresh_token = Some(token);
    }
    if let Some(id) = get("GUARD_CLIENT_ID") {
        config.credentials.client_id = Some(id);
    }
    if let Some(secret) = get("GUARD_CLIENT_SECRET") {
        config.credentials.client_secret = Some(secret);
    }
    if let Some(raw) = get("GUARD_AUTO_REFRESH") {
        config.credentials.auto_refresh = parse_bool("GUARD_AUTO_REFRESH", &raw)?;
    }
    if let Some(raw) = get("GUARD_PACKS") {
        config.policy.packs = split_list(&raw);
    }
    if let Some(raw) = get("GUARD_METHOD_ALLOWLIST") {
        config.policy.method_allowlist = split_list(&raw);
    }
    if let Some(raw) = get("GUARD_REQUIRE_PLAN") {
        config.policy.require_plan = parse_bool("GUARD_REQUIRE_PLAN", &raw)?;
    }
    if let Some(path) = get("GUARD_AUDIT_FILE") {
        config.audit.path = path;
    }
    if let Some(dir) = get("GUARD_STATE_DIR") {
        config.storage.state_dir = dir;
    }
    if let Some(token) = get("GUARD_APPLICATION_TOKEN") {
        config.worker.application_token = Some(token);
    }

    Ok(config)
}

/// Split a comma separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, raw)),
    }
}

fn invalid(var: &str, value: &str) -> ConfigError {
    ConfigError::Override {
        var: var.to_string(),
        value: value.to_string(),
    }
}
