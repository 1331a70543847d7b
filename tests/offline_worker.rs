//! Offline worker cycles, dead-lettering and shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use api_guard::clock::{Clock, ManualClock};
use api_guard::error::GuardResult;
use api_guard::store::{MemoryStore, StateStore};
use api_guard::worker::{
    EventHandler, GatewayHandler, GatewayQueue, HandlerError, MemoryQueue, OfflineQueue,
    OfflineWorker, QueueBatch, QueueItem, WorkerError, WorkerOptions,
};
use api_guard::{CallRequest, GuardError, Shutdown};

mod common;

use common::{harness, FailingNamespace};

/// Fails every item whose identity is listed.
struct FailingOn(Vec<String>);

#[async_trait]
impl EventHandler for FailingOn {
    async fn handle(&self, item: &QueueItem) -> Result<(), HandlerError> {
        let identity = item.identity();
        if self.0.iter().any(|id| *id == identity) {
            return Err(HandlerError::Rejected(format!("cannot process {identity}")));
        }
        Ok(())
    }
}

fn lead_event(n: u32) -> Value {
    json!({
        "message_id": format!("m{n}"),
        "event": "ONCRMLEADADD",
        "data": {"FIELDS": {"ID": n}},
    })
}

fn options(max_retries: u32) -> WorkerOptions {
    WorkerOptions {
        poll_interval: Duration::from_millis(50),
        batch_size: 50,
        max_retries,
        max_consecutive_errors: 3,
        application_token: None,
    }
}

fn worker(
    queue: Arc<dyn OfflineQueue>,
    handler: Arc<dyn EventHandler>,
    store: Arc<dyn StateStore>,
    max_retries: u32,
) -> OfflineWorker {
    OfflineWorker::new(
        "portal.bitrix24.test",
        queue,
        handler,
        store,
        Arc::new(ManualClock::default()),
        options(max_retries),
    )
}

#[tokio::test]
async fn test_poisoned_events_land_in_dead_letters() {
    let queue = Arc::new(MemoryQueue::with_items((1..=10).map(lead_event)));
    let failing = vec!["m3".to_string(), "m5".to_string(), "m8".to_string()];
    let mut worker = worker(
        queue.clone(),
        Arc::new(FailingOn(failing.clone())),
        Arc::new(MemoryStore::new()),
        3,
    );

    let first = worker.run_once().await.unwrap();
    assert_eq!(first.polled, 10);
    assert_eq!(first.succeeded, 7);
    assert_eq!(first.retrying, 3);
    assert!(!first.cleared_batch);
    assert_eq!(queue.identities(), failing);

    let second = worker.run_once().await.unwrap();
    assert_eq!(second.retrying, 3);
    assert_eq!(queue.len(), 3);

    let third = worker.run_once().await.unwrap();
    assert_eq!(third.dead_lettered, 3);
    assert!(third.cleared_batch);
    assert!(queue.is_empty());

    let records = worker.dead_letters().list().unwrap();
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.event, "ONCRMLEADADD");
        assert!(record.error.starts_with("cannot process"));
    }
    let mut ids: Vec<&str> = records.iter().map(|r| r.identity()).collect();
    ids.sort();
    assert_eq!(ids, vec!["m3", "m5", "m8"]);

    let mut reported = queue.reported_errors();
    reported.sort();
    assert_eq!(reported, failing);

    // Counters are cleared once the item is settled.
    assert_eq!(worker.retry_budget().get("m3").unwrap(), None);

    let empty = worker.run_once().await.unwrap();
    assert_eq!(empty.polled, 0);
}

#[tokio::test]
async fn test_dead_letter_write_failure_keeps_event_queued() {
    let queue = Arc::new(MemoryQueue::with_items([lead_event(1), lead_event(2)]));
    let mut worker = worker(
        queue.clone(),
        Arc::new(FailingOn(vec!["m2".into()])),
        Arc::new(FailingNamespace::new("dead_letters")),
        1,
    );

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(report.acknowledged, vec!["m1"]);
    assert_eq!(queue.identities(), vec!["m2"]);
    assert!(queue.reported_errors().is_empty());

    // Still queued on the next cycle.
    let again = worker.run_once().await.unwrap();
    assert_eq!(again.polled, 1);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_redelivered_dead_letter_is_written_once() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::with_items([lead_event(4)]));
    let mut first = worker(queue.clone(), Arc::new(FailingOn(vec!["m4".into()])), store.clone(), 1);
    first.run_once().await.unwrap();
    assert!(queue.is_empty());

    // The source redelivers after a crash between write and acknowledge.
    queue.push(lead_event(4));
    let mut second = worker(queue.clone(), Arc::new(FailingOn(vec!["m4".into()])), store, 1);
    second.run_once().await.unwrap();
    assert!(queue.is_empty());
    assert_eq!(second.dead_letters().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_gateway_backed_cycle() {
    let h = harness();
    h.transport.push_ok(json!({
        "result": {
            "process_id": "proc-1",
            "events": [
                {"message_id": "m1", "event": "ONCRMLEADADD", "data": {"FIELDS": {"ID": 10}}},
            ],
        }
    }));
    h.transport.push_ok(json!({"result": {"ID": "10", "TITLE": "Lead"}}));
    h.transport.push_ok(json!({"result": true}));

    let handler = GatewayHandler::new(h.gateway.clone(), |item: &QueueItem| {
        let id = item.data.as_ref()?.get("FIELDS")?.get("ID")?.clone();
        Some(CallRequest::builder("crm.lead.get").params(json!({"id": id})).build())
    });
    let mut worker = OfflineWorker::new(
        h.gateway.tenant().to_string(),
        Arc::new(GatewayQueue::new(h.gateway.clone())),
        Arc::new(handler),
        h.store.clone(),
        h.clock.clone(),
        options(3),
    );

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(report.cleared_batch);

    assert_eq!(
        h.transport.methods(),
        vec!["event.offline.get", "crm.lead.get", "event.offline.clear"]
    );
    let calls = h.transport.calls();
    assert_eq!(calls[0].params["clear"], "0");
    assert_eq!(calls[1].params["id"], 10);
    assert_eq!(calls[2].params, json!({"process_id": "proc-1"}));

    // The handled call used the message id as its idempotency key.
    let entries = h.audit.entries();
    assert_eq!(entries[1].idempotency_key.as_deref(), Some("m1"));
}

#[tokio::test]
async fn test_invalid_offline_response_fails_cycle() {
    let h = harness();
    h.transport.push_ok(json!({"result": {"process_id": 7}}));

    let mut worker = OfflineWorker::new(
        h.gateway.tenant().to_string(),
        Arc::new(GatewayQueue::new(h.gateway.clone())),
        Arc::new(FailingOn(vec![])),
        h.store.clone(),
        h.clock.clone(),
        options(3),
    );
    let err = worker.run_once().await.unwrap_err();
    assert_eq!(err.remote_code(), Some("INVALID_OFFLINE_RESPONSE_SCHEMA"));
}

#[tokio::test]
async fn test_shutdown_stops_idle_worker() {
    let queue = Arc::new(MemoryQueue::new());
    let worker = worker(
        queue.clone(),
        Arc::new(FailingOn(vec![])),
        Arc::new(MemoryStore::new()),
        3,
    );
    let shutdown = Shutdown::new();
    let handle = tokio::spawn(worker.run(shutdown.subscribe()));

    while queue.polls() < 3 {
        tokio::task::yield_now().await;
    }
    shutdown.trigger();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stops after shutdown")
        .unwrap();
    assert!(result.is_ok());
}

/// Requests shutdown while the first item of a batch is being handled.
struct ShutdownMidBatch(Arc<Shutdown>);

#[async_trait]
impl EventHandler for ShutdownMidBatch {
    async fn handle(&self, _item: &QueueItem) -> Result<(), HandlerError> {
        self.0.trigger();
        Ok(())
    }
}

#[tokio::test]
async fn test_in_flight_batch_completes_before_shutdown() {
    let queue = Arc::new(MemoryQueue::with_items((1..=3).map(lead_event)));
    let shutdown = Arc::new(Shutdown::new());
    let receiver = shutdown.subscribe();
    let worker = worker(
        queue.clone(),
        Arc::new(ShutdownMidBatch(shutdown.clone())),
        Arc::new(MemoryStore::new()),
        3,
    );

    worker.run(receiver).await.unwrap();
    assert!(queue.is_empty());
    assert_eq!(queue.polls(), 1);
}

/// Poll always fails with the given error.
struct BrokenQueue(fn() -> GuardError);

#[async_trait]
impl OfflineQueue for BrokenQueue {
    async fn poll(&self, _limit: usize) -> GuardResult<QueueBatch> {
        Err((self.0)())
    }

    async fn acknowledge(&self, _token: &str, _ids: &[String]) -> GuardResult<()> {
        Ok(())
    }

    async fn report_error(&self, _token: &str, _ids: &[String]) -> GuardResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_fatal_error_stops_worker() {
    let queue = Arc::new(BrokenQueue(|| GuardError::AuthExpired {
        method: "event.offline.get".into(),
        attempts: 2,
    }));
    let worker = worker(queue, Arc::new(FailingOn(vec![])), Arc::new(MemoryStore::new()), 3);
    let shutdown = Shutdown::new();

    let err = worker.run(shutdown.subscribe()).await.unwrap_err();
    assert!(matches!(err, WorkerError::Fatal(GuardError::AuthExpired { .. })));
}

#[tokio::test]
async fn test_consecutive_errors_are_bounded() {
    let queue = Arc::new(BrokenQueue(|| GuardError::TransientServer {
        method: "event.offline.get".into(),
        retries: 4,
        code: "INTERNAL_SERVER_ERROR".into(),
        message: "down".into(),
    }));
    let worker = worker(queue, Arc::new(FailingOn(vec![])), Arc::new(MemoryStore::new()), 3);
    let shutdown = Shutdown::new();

    let err = worker.run(shutdown.subscribe()).await.unwrap_err();
    assert!(matches!(err, WorkerError::TooManyErrors { count: 3, .. }), "{err}");
}

/// Returns the same items on every poll without a process id.
struct TokenlessQueue {
    polls: AtomicU32,
}

#[async_trait]
impl OfflineQueue for TokenlessQueue {
    async fn poll(&self, _limit: usize) -> GuardResult<QueueBatch> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(QueueBatch {
            token: None,
            items: vec![QueueItem::from_value(lead_event(1))],
        })
    }

    async fn acknowledge(&self, _token: &str, _ids: &[String]) -> GuardResult<()> {
        panic!("nothing can be acknowledged without a token");
    }

    async fn report_error(&self, _token: &str, _ids: &[String]) -> GuardResult<()> {
        panic!("nothing can be reported without a token");
    }
}

/// Counts handled items.
#[derive(Default)]
struct Counting(AtomicU32);

#[async_trait]
impl EventHandler for Counting {
    async fn handle(&self, _item: &QueueItem) -> Result<(), HandlerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_batch_without_token_is_idle() {
    let queue = Arc::new(TokenlessQueue {
        polls: AtomicU32::new(0),
    });
    let handler = Arc::new(Counting::default());
    let clock = Arc::new(ManualClock::default());
    let mut worker = OfflineWorker::new(
        "portal.bitrix24.test",
        queue.clone(),
        handler.clone(),
        Arc::new(MemoryStore::new()),
        clock.clone(),
        options(3),
    );

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.polled, 0);
    assert!(!report.settled_any());
    assert_eq!(handler.0.load(Ordering::SeqCst), 0);

    // The loop waits a poll interval between such cycles.
    let shutdown = Shutdown::new();
    let handle = tokio::spawn(worker.run(shutdown.subscribe()));
    while queue.polls.load(Ordering::SeqCst) < 4 {
        tokio::task::yield_now().await;
    }
    shutdown.trigger();
    handle.await.unwrap().unwrap();
    assert!(clock.total_slept() >= Duration::from_millis(100));
    assert_eq!(handler.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_store_failure_mid_batch_still_settles_the_rest() {
    let queue = Arc::new(MemoryQueue::with_items((1..=3).map(lead_event)));
    let mut worker = worker(
        queue.clone(),
        Arc::new(FailingOn(vec!["m2".into()])),
        Arc::new(FailingNamespace::new("offline_retries")),
        3,
    );

    let err = worker.run_once().await.unwrap_err();
    assert!(matches!(err, GuardError::Store(_)), "{err}");
    // m1 and m3 were acknowledged; m2 stays for the next cycle.
    assert_eq!(queue.identities(), vec!["m2"]);
}
