//! The poll → process → acknowledge loop.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::clock::Clock;
use crate::config::schema::WorkerConfig;
use crate::error::{GuardError, GuardResult};
use crate::observability::metrics;
use crate::security::secure_compare;
use crate::store::StateStore;
use crate::worker::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::worker::processor::EventHandler;
use crate::worker::queue::{OfflineQueue, QueueItem};
use crate::worker::retry_budget::{RetryBudget, RetryRecord};

/// Where the worker is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Processing,
    DeadLettering,
    Acknowledging,
    Stopped,
}

/// Loop tuning, usually taken from [`WorkerConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
    pub max_consecutive_errors: u32,
    pub application_token: Option<String>,
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries.max(1),
            max_consecutive_errors: config.max_consecutive_errors.max(1),
            application_token: config
                .application_token
                .clone()
                .filter(|token| !token.is_empty()),
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub polled: usize,
    pub succeeded: usize,
    /// Failed but still within budget; left in the queue.
    pub retrying: usize,
    pub dead_lettered: usize,
    /// Wrong application token; left in the queue.
    pub rejected: usize,
    /// Ids acknowledged; empty with `cleared_batch` means everything.
    pub acknowledged: Vec<String>,
    pub cleared_batch: bool,
}

impl CycleReport {
    /// Whether any item left the queue this cycle.
    pub fn settled_any(&self) -> bool {
        self.succeeded + self.dead_lettered > 0
    }
}

/// Why the worker loop stopped with an error.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("fatal error, stopping: {0}")]
    Fatal(GuardError),

    #[error("stopping after {count} consecutive errors, last: {last}")]
    TooManyErrors { count: u32, last: GuardError },
}

/// Consumes one offline queue.
pub struct OfflineWorker {
    tenant: String,
    queue: Arc<dyn OfflineQueue>,
    handler: Arc<dyn EventHandler>,
    budget: RetryBudget,
    dead_letters: DeadLetterStore,
    clock: Arc<dyn Clock>,
    options: WorkerOptions,
    state: WorkerState,
}

impl OfflineWorker {
    pub fn new(
        tenant: impl Into<String>,
        queue: Arc<dyn OfflineQueue>,
        handler: Arc<dyn EventHandler>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        options: WorkerOptions,
    ) -> Self {
        let tenant = tenant.into();
        Self {
            budget: RetryBudget::new(store.clone(), clock.clone(), tenant.clone(), options.max_retries),
            dead_letters: DeadLetterStore::new(store, tenant.clone()),
            tenant,
            queue,
            handler,
            clock,
            options,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    pub fn retry_budget(&self) -> &RetryBudget {
        &self.budget
    }

    /// Poll one batch and settle every item in it.
    ///
    /// Acknowledgement happens once, after the whole batch was evaluated.
    pub async fn run_once(&mut self) -> GuardResult<CycleReport> {
        self.state = WorkerState::Polling;
        let batch = match self.queue.poll(self.options.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                self.state = WorkerState::Idle;
                return Err(e);
            }
        };
        if batch.items.is_empty() {
            self.state = WorkerState::Idle;
            return Ok(CycleReport::default());
        }
        // Items cannot be acknowledged without a token, so none are taken.
        let Some(token) = batch.token.filter(|t| !t.is_empty()) else {
            tracing::warn!(items = batch.items.len(), "Offline batch has no process id, skipping");
            self.state = WorkerState::Idle;
            return Ok(CycleReport::default());
        };
        let mut report = CycleReport {
            polled: batch.items.len(),
            ..CycleReport::default()
        };

        self.state = WorkerState::Processing;
        let mut ack_ids = Vec::new();
        let mut error_ids = Vec::new();
        let mut pending = false;
        let mut failure = None;

        for item in &batch.items {
            let settled = match self.process(item, &mut report).await {
                Ok(settled) => settled,
                Err(e) => {
                    tracing::error!(
                        identity = %item.identity(),
                        error = %e,
                        "Failed to settle event, leaving it queued"
                    );
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    Settled::Pending
                }
            };
            match settled {
                Settled::Done => {
                    if let Some(id) = &item.message_id {
                        ack_ids.push(id.clone());
                    }
                }
                Settled::DeadLettered => {
                    if let Some(id) = &item.message_id {
                        ack_ids.push(id.clone());
                        error_ids.push(id.clone());
                    }
                }
                Settled::Pending => pending = true,
            }
        }

        self.state = WorkerState::Acknowledging;
        if !error_ids.is_empty() {
            if let Err(e) = self.queue.report_error(&token, &error_ids).await {
                tracing::warn!(error = %e, ids = ?error_ids, "Failed to report dead-lettered events");
            }
        }
        let result = if !pending {
            report.cleared_batch = true;
            self.queue.acknowledge(&token, &[]).await
        } else if !ack_ids.is_empty() {
            self.queue.acknowledge(&token, &ack_ids).await
        } else {
            Ok(())
        };
        self.state = WorkerState::Idle;
        result?;
        if let Some(e) = failure {
            return Err(e);
        }

        report.acknowledged = ack_ids;
        tracing::info!(
            polled = report.polled,
            succeeded = report.succeeded,
            retrying = report.retrying,
            dead_lettered = report.dead_lettered,
            rejected = report.rejected,
            "Batch processed"
        );
        Ok(report)
    }

    async fn process(&mut self, item: &QueueItem, report: &mut CycleReport) -> GuardResult<Settled> {
        let identity = item.identity();

        if let Some(reason) = item.validate_schema() {
            let now = self.clock.now();
            let record = DeadLetterRecord::from_item(
                &self.tenant,
                item,
                format!("INVALID_EVENT_SCHEMA: {reason}"),
                0,
                now,
                now,
            );
            return Ok(self.dead_letter(&record, report));
        }

        if let Some(expected) = self.options.application_token.as_deref() {
            if !secure_compare(Some(expected), item.application_token()) {
                tracing::warn!(identity = %identity, "Invalid application token, leaving event queued");
                report.rejected += 1;
                return Ok(Settled::Pending);
            }
        }

        match self.handler.handle(item).await {
            Ok(()) => {
                if let Err(e) = self.budget.clear(&identity) {
                    tracing::warn!(identity = %identity, error = %e, "Failed to clear retry counter");
                }
                report.succeeded += 1;
                Ok(Settled::Done)
            }
            Err(e) => {
                let history = self.budget.fail(&identity, &e.to_string())?;
                if !self.budget.is_exhausted(&history) {
                    tracing::warn!(
                        identity = %identity,
                        attempt = history.count,
                        error = %e,
                        "Event failed, will retry"
                    );
                    report.retrying += 1;
                    return Ok(Settled::Pending);
                }
                let record = self.record_for(item, &history);
                let settled = self.dead_letter(&record, report);
                if settled == Settled::DeadLettered {
                    if let Err(e) = self.budget.clear(&identity) {
                        tracing::warn!(identity = %identity, error = %e, "Failed to clear retry counter");
                    }
                }
                Ok(settled)
            }
        }
    }

    fn record_for(&self, item: &QueueItem, history: &RetryRecord) -> DeadLetterRecord {
        DeadLetterRecord::from_item(
            &self.tenant,
            item,
            history.last_error.clone(),
            history.count,
            history.first_seen,
            history.last_seen,
        )
    }

    /// Write the record before anything acknowledges the item. A failed
    /// write leaves the item queued for the next cycle.
    fn dead_letter(&mut self, record: &DeadLetterRecord, report: &mut CycleReport) -> Settled {
        self.state = WorkerState::DeadLettering;
        let settled = match self.dead_letters.put(record) {
            Ok(_) => {
                metrics::record_dead_letter(&record.event);
                tracing::warn!(
                    identity = record.identity(),
                    event = %record.event,
                    retries = record.retry_count,
                    error = %record.error,
                    "Event dead-lettered"
                );
                report.dead_lettered += 1;
                Settled::DeadLettered
            }
            Err(e) => {
                tracing::error!(
                    identity = record.identity(),
                    error = %e,
                    "Dead-letter write failed, leaving event queued"
                );
                Settled::Pending
            }
        };
        self.state = WorkerState::Processing;
        settled
    }

    /// Run cycles until `shutdown` fires.
    ///
    /// Shutdown is checked between batches; a batch in flight always
    /// completes. Cycles that settle nothing and failed cycles wait one poll
    /// interval.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), WorkerError> {
        let mut consecutive_errors = 0u32;
        tracing::info!(tenant = %self.tenant, "Offline worker started");

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            let idle = match self.run_once().await {
                Ok(report) => {
                    consecutive_errors = 0;
                    !report.settled_any()
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::error!(
                        kind = e.kind(),
                        error = %e,
                        consecutive_errors,
                        "Worker cycle failed"
                    );
                    if e.is_fatal() {
                        self.state = WorkerState::Stopped;
                        return Err(WorkerError::Fatal(e));
                    }
                    if consecutive_errors >= self.options.max_consecutive_errors {
                        self.state = WorkerState::Stopped;
                        return Err(WorkerError::TooManyErrors {
                            count: consecutive_errors,
                            last: e,
                        });
                    }
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.clock.sleep(self.options.poll_interval) => {}
                    _ = shutdown.recv() => break,
                }
            }
        }

        self.state = WorkerState::Stopped;
        tracing::info!("Worker stopped gracefully");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Done,
    DeadLettered,
    Pending,
}
