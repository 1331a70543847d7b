//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use api_guard::api::{ApiError, RemoteCall, Transport};
use api_guard::clock::ManualClock;
use api_guard::config::schema::GuardConfig;
use api_guard::gateway::MemoryAuditSink;
use api_guard::store::{MemoryStore, StateStore, StoreError, StoreResult};
use api_guard::PolicyGateway;

/// Transport that replays scripted responses and records every call.
///
/// When the script runs out it answers `{"result": <call number>}`.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<Value, ApiError>>>,
    calls: Mutex<Vec<RemoteCall>>,
    count: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, body: Value) {
        self.script.lock().unwrap().push_back(Ok(body));
    }

    pub fn push_err(&self, code: &str, status: u16) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(ApiError::new(code, status, format!("{code} from mock"))));
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.method).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&self, call: &RemoteCall) -> Result<Value, ApiError> {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.lock().unwrap().push(call.clone());
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(json!({ "result": n })))
    }
}

/// Webhook-mode configuration tuned for deterministic tests.
pub fn test_config() -> GuardConfig {
    let mut config = GuardConfig::default();
    config.tenant.domain = "portal.bitrix24.test".into();
    config.tenant.webhook_user_id = Some("1".into());
    config.tenant.webhook_code = Some("hook-secret".into());
    config.retries.jitter_ms = 0;
    config.retries.base_delay_ms = 500;
    config.plans.sequential_ids = true;
    config
}

pub struct Harness {
    pub gateway: Arc<PolicyGateway>,
    pub transport: Arc<MockTransport>,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<MemoryAuditSink>,
    pub store: Arc<dyn StateStore>,
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: GuardConfig) -> Harness {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    harness_on(config, store)
}

pub fn harness_on(config: GuardConfig, store: Arc<dyn StateStore>) -> Harness {
    let transport = Arc::new(MockTransport::new());
    let clock = Arc::new(ManualClock::default());
    let audit = Arc::new(MemoryAuditSink::new());
    let gateway = PolicyGateway::builder(config)
        .store(store.clone())
        .transport(transport.clone())
        .clock(clock.clone())
        .audit_sink(audit.clone())
        .build()
        .expect("gateway builds from test config");
    Harness {
        gateway: Arc::new(gateway),
        transport,
        clock,
        audit,
        store,
    }
}

/// Store whose writes to one namespace always fail.
pub struct FailingNamespace {
    inner: MemoryStore,
    namespace: &'static str,
}

impl FailingNamespace {
    pub fn new(namespace: &'static str) -> Self {
        Self {
            inner: MemoryStore::new(),
            namespace,
        }
    }

    fn refuse(&self) -> StoreError {
        StoreError::Io {
            path: self.namespace.into(),
            source: std::io::Error::other("disk full"),
        }
    }
}

impl StateStore for FailingNamespace {
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Value>> {
        self.inner.get(namespace, key)
    }

    fn mutate(
        &self,
        namespace: &str,
        key: &str,
        f: &mut dyn FnMut(&mut Option<Value>),
    ) -> StoreResult<()> {
        if namespace == self.namespace {
            return Err(self.refuse());
        }
        self.inner.mutate(namespace, key, f)
    }

    fn scan(&self, namespace: &str) -> StoreResult<Vec<(String, Value)>> {
        self.inner.scan(namespace)
    }

    fn retain(
        &self,
        namespace: &str,
        keep: &mut dyn FnMut(&str, &Value) -> bool,
    ) -> StoreResult<()> {
        self.inner.retain(namespace, keep)
    }
}
