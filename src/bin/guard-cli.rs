use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde_json::{json, Value};

use api_guard::config::loader::split_list;
use api_guard::config::{load_config, GuardConfig};
use api_guard::observability::logging;
use api_guard::policy::allowlist::{DEFAULT_PACKS, PACKS};
use api_guard::policy::Policy;
use api_guard::security::mask_secrets;
use api_guard::{CallRequest, GuardError, PlanExecution, PolicyGateway};

#[derive(Parser)]
#[command(name = "guard-cli")]
#[command(about = "Run a single policy-checked API call", long_about = None)]
struct Cli {
    /// Remote method, e.g. crm.lead.list
    method: Option<String>,

    /// JSON object with method params
    #[arg(long, default_value = "{}")]
    params: String,

    /// Comma-separated capability packs. Use 'none' to disable packs.
    #[arg(long)]
    packs: Option<String>,

    /// Comma-separated method patterns, e.g. 'user.*,crm.*,batch'
    #[arg(long)]
    method_allowlist: Option<String>,

    /// Required for write methods and write batch commands
    #[arg(long)]
    confirm_write: bool,

    /// Required for destructive methods (delete/remove/unbind/unregister)
    #[arg(long)]
    confirm_destructive: bool,

    /// Persist an execution plan and print it without calling the API
    #[arg(long, conflicts_with = "execute_plan")]
    plan_only: bool,

    /// Execute a previously created plan
    #[arg(long, value_name = "PLAN_ID")]
    execute_plan: Option<String>,

    /// Explicit idempotency key for write/destructive operations
    #[arg(long)]
    idempotency_key: Option<String>,

    /// Allow methods outside the allowlist for this call
    #[arg(long)]
    allow_unlisted: bool,

    /// JSONL audit file
    #[arg(long)]
    audit_file: Option<PathBuf>,

    /// Disable audit logging for this call
    #[arg(long)]
    no_audit: bool,

    /// Print available packs and exit
    #[arg(long)]
    list_packs: bool,

    /// Use the REST v3 endpoint (OAuth mode only)
    #[arg(long)]
    rest_v3: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print secrets in output unmasked
    #[arg(long)]
    no_mask_secrets: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mask = !cli.no_mask_secrets;

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => apply_flags(config, &cli),
        Err(e) => return report("config_error", &e.to_string(), 2, mask),
    };
    logging::init(&config.observability.log_level);

    if cli.list_packs {
        return match Policy::from_config(&config.policy) {
            Ok(policy) => {
                let available: BTreeMap<&str, &[&str]> = PACKS.iter().copied().collect();
                emit(
                    &json!({
                        "default_packs": DEFAULT_PACKS,
                        "available_packs": available,
                        "selected_packs": policy.packs(),
                    }),
                    mask,
                )
            }
            Err(e) => report("config_error", &e.to_string(), 2, mask),
        };
    }

    let params: Value = match serde_json::from_str(&cli.params) {
        Ok(params) => params,
        Err(e) => {
            return report(
                "validation_error",
                &format!("invalid JSON in --params: {e}"),
                2,
                mask,
            )
        }
    };

    let method = cli.method.as_deref().map(str::trim).unwrap_or_default();
    if method.is_empty() && cli.execute_plan.is_none() {
        return report(
            "validation_error",
            "method is required (or use --execute-plan)",
            2,
            mask,
        );
    }

    let gateway = match PolicyGateway::builder(config).build() {
        Ok(gateway) => gateway,
        Err(e) => return fail(&e, mask),
    };

    if let Some(plan_id) = cli.execute_plan.as_deref() {
        let execution = PlanExecution {
            confirm_write: cli.confirm_write,
            confirm_destructive: cli.confirm_destructive,
            allow_unlisted: cli.allow_unlisted,
            idempotency_key: cli.idempotency_key.clone(),
            expected_method: (!method.is_empty()).then(|| method.to_string()),
        };
        return match gateway.execute_plan(plan_id, execution).await {
            Ok(outcome) => emit(&outcome.payload, mask),
            Err(e) => fail(&e, mask),
        };
    }

    let mut builder = CallRequest::builder(method)
        .params(params)
        .confirm_write(cli.confirm_write)
        .confirm_destructive(cli.confirm_destructive)
        .allow_unlisted(cli.allow_unlisted)
        .rest_v3(cli.rest_v3);
    if let Some(key) = cli.idempotency_key.as_deref() {
        builder = builder.idempotency_key(key);
    }
    let request = builder.build();

    if cli.plan_only {
        return match gateway.plan(request).await {
            Ok(plan) => {
                let next = format!("guard-cli --execute-plan {}", plan.plan_id);
                emit(&json!({ "plan": plan, "next": { "execute_command": next } }), mask)
            }
            Err(e) => fail(&e, mask),
        };
    }

    match gateway.execute(request).await {
        Ok(outcome) => {
            tracing::debug!(
                request_id = %outcome.request_id,
                retries = outcome.retries,
                replayed = outcome.replayed,
                "Call finished"
            );
            emit(&outcome.payload, mask)
        }
        Err(e) => fail(&e, mask),
    }
}

/// Command-line flags win over file and environment settings.
fn apply_flags(mut config: GuardConfig, cli: &Cli) -> GuardConfig {
    if let Some(packs) = cli.packs.as_deref() {
        config.policy.packs = split_list(packs);
    }
    if let Some(allowlist) = cli.method_allowlist.as_deref() {
        config.policy.method_allowlist = split_list(allowlist);
    }
    if let Some(path) = cli.audit_file.as_ref() {
        config.audit.path = path.to_string_lossy().into_owned();
    }
    if cli.no_audit {
        config.audit.enabled = false;
    }
    config
}

fn emit(value: &Value, mask: bool) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", if mask { mask_secrets(&text) } else { text });
            ExitCode::SUCCESS
        }
        Err(e) => report("serialization_error", &e.to_string(), 1, mask),
    }
}

fn fail(error: &GuardError, mask: bool) -> ExitCode {
    let body = json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
            "code": error.remote_code(),
            "retries": error.retries(),
        }
    });
    print_error(&body, mask);
    ExitCode::from(error.exit_code() as u8)
}

fn report(kind: &str, message: &str, code: u8, mask: bool) -> ExitCode {
    print_error(&json!({ "error": { "kind": kind, "message": message } }), mask);
    ExitCode::from(code)
}

fn print_error(body: &Value, mask: bool) {
    let text = body.to_string();
    eprintln!("{}", if mask { mask_secrets(&text) } else { text });
}
