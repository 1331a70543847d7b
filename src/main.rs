//! api-guard worker daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                      WORKER                          │
//!                 │                                                      │
//!   offline queue │  ┌─────────┐    ┌───────────┐    ┌──────────────┐    │
//!   ──────────────┼─▶│  poll   │───▶│  handler  │───▶│   gateway    │────┼──▶ remote API
//!                 │  └─────────┘    └─────┬─────┘    │ policy/limit │    │
//!                 │                       │          │ retry/audit  │    │
//!                 │                       ▼          └──────────────┘    │
//!                 │              ┌────────────────┐                      │
//!                 │              │ retry budget / │                      │
//!                 │              │  dead letters  │                      │
//!                 │              └───────┬────────┘                      │
//!   acknowledge   │                      │                               │
//!   ◀─────────────┼──────────────────────┘                               │
//!                 │                                                      │
//!                 │  config watcher ─▶ policy hot reload                 │
//!                 │  signals ─▶ shutdown broadcast                       │
//!                 └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use api_guard::clock::SystemClock;
use api_guard::config::load_config;
use api_guard::config::watcher::ConfigWatcher;
use api_guard::lifecycle::{wait_for_signal, Shutdown};
use api_guard::observability::{logging, metrics};
use api_guard::store;
use api_guard::worker::{GatewayQueue, LoggingHandler, OfflineWorker, WorkerOptions};
use api_guard::PolicyGateway;

#[derive(Parser)]
#[command(name = "api-guard")]
#[command(about = "Offline queue worker for the guarded API executor", long_about = None)]
struct Args {
    /// TOML configuration file. Environment overrides apply either way.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("api-guard: {e}");
            return ExitCode::from(2);
        }
    };

    logging::init(&config.observability.log_level);
    tracing::info!("api-guard v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let state = store::open(&config.storage);
    let gateway = match PolicyGateway::builder(config.clone())
        .store(state.clone())
        .build()
    {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            tracing::error!(error = %e, "Failed to build gateway");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    tracing::info!(
        tenant = gateway.tenant(),
        packs = ?gateway.policy().packs(),
        poll_interval_ms = config.worker.poll_interval_ms,
        batch_size = config.worker.batch_size,
        max_retries = config.worker.max_retries,
        "Configuration loaded"
    );

    let mut worker = OfflineWorker::new(
        gateway.tenant().to_string(),
        Arc::new(GatewayQueue::new(gateway.clone())),
        Arc::new(LoggingHandler),
        state,
        Arc::new(SystemClock),
        WorkerOptions::from(&config.worker),
    );

    if args.once {
        return match worker.run_once().await {
            Ok(report) => {
                tracing::info!(
                    polled = report.polled,
                    succeeded = report.succeeded,
                    dead_lettered = report.dead_lettered,
                    "Single cycle complete"
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "Cycle failed");
                ExitCode::FAILURE
            }
        };
    }

    let shutdown = Shutdown::new();

    // Kept alive for the lifetime of the loop; dropping it stops the events.
    let _watcher = match args.config.as_deref() {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let gateway = gateway.clone();
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(policy) = updates.recv() => {
                            if let Err(e) = gateway.reload_policy(&policy) {
                                tracing::error!(error = %e, "Policy reload rejected. Keeping current policy.");
                            }
                        }
                        _ = stop.recv() => break,
                        else => break,
                    }
                }
            });
            match watcher.run() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    let worker_shutdown = shutdown.subscribe();
    let mut handle = tokio::spawn(worker.run(worker_shutdown));

    let joined = tokio::select! {
        signal = wait_for_signal() => {
            tracing::info!(signal, "Shutdown requested, finishing current batch");
            shutdown.trigger();
            (&mut handle).await
        }
        joined = &mut handle => {
            shutdown.trigger();
            joined
        }
    };

    let code = match joined {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Worker stopped");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker task panicked");
            ExitCode::FAILURE
        }
    };

    tracing::info!("Shutdown complete");
    code
}
