//! Dead-letter storage for items that exhausted their retry budget.
//!
//! Records are keyed by item identity and written at most once, so a crash
//! between the write and the acknowledgement only causes a harmless rewrite
//! attempt on the next cycle.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GuardResult;
use crate::store::{self, StateStore};
use crate::worker::queue::QueueItem;

const NAMESPACE: &str = "dead_letters";

/// A terminally failed queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub tenant: String,
    pub event: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub dedup_key: String,
    pub payload_hash: String,
    pub payload: Value,
    pub error: String,
    pub retry_count: u32,
    pub first_seen: f64,
    pub last_seen: f64,
}

impl DeadLetterRecord {
    pub fn from_item(
        tenant: &str,
        item: &QueueItem,
        error: impl Into<String>,
        retry_count: u32,
        first_seen: f64,
        last_seen: f64,
    ) -> Self {
        Self {
            tenant: tenant.to_string(),
            event: item.event_name().to_string(),
            message_id: item.message_id.clone(),
            dedup_key: item.dedup_key(),
            payload_hash: item.payload_hash(),
            payload: item.raw.clone(),
            error: error.into(),
            retry_count,
            first_seen,
            last_seen,
        }
    }

    pub fn identity(&self) -> &str {
        self.message_id.as_deref().unwrap_or(&self.dedup_key)
    }
}

pub struct DeadLetterStore {
    store: Arc<dyn StateStore>,
    tenant: String,
}

impl DeadLetterStore {
    pub fn new(store: Arc<dyn StateStore>, tenant: impl Into<String>) -> Self {
        Self {
            store,
            tenant: tenant.into(),
        }
    }

    fn slot_key(&self, identity: &str) -> String {
        format!("{}|{identity}", self.tenant)
    }

    /// Store `record` unless one exists for the same identity.
    /// Returns false when it was already there.
    pub fn put(&self, record: &DeadLetterRecord) -> GuardResult<bool> {
        let inserted = store::mutate_as::<DeadLetterRecord, bool>(
            self.store.as_ref(),
            NAMESPACE,
            &self.slot_key(record.identity()),
            |slot| {
                if slot.is_some() {
                    return false;
                }
                *slot = Some(record.clone());
                true
            },
        )?;
        Ok(inserted)
    }

    pub fn get(&self, identity: &str) -> GuardResult<Option<DeadLetterRecord>> {
        Ok(store::get_as(self.store.as_ref(), NAMESPACE, &self.slot_key(identity))?)
    }

    /// Every record of this tenant, oldest failure first.
    pub fn list(&self) -> GuardResult<Vec<DeadLetterRecord>> {
        let prefix = format!("{}|", self.tenant);
        let mut records: Vec<DeadLetterRecord> = self
            .store
            .scan(NAMESPACE)?
            .into_iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(_, value)| serde_json::from_value(value).ok())
            .collect();
        records.sort_by(|a, b| a.first_seen.total_cmp(&b.first_seen));
        Ok(records)
    }
}
