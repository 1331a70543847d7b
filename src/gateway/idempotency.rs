//! Idempotent replay of mutating calls.
//!
//! A record moves `in_progress → done` and lives until its expiry. The
//! in-progress marker is a lease no shorter than the slowest possible call,
//! so only a crashed caller's reservation ever lapses.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::error::{GuardError, GuardResult};
use crate::store::{self, StateStore};

const NAMESPACE: &str = "idempotency";

/// Parameter names that carry a caller-supplied deduplication id.
const KEY_FIELDS: &[&str] = &["idempotency_key", "origin_id", "external_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    InProgress,
    Done,
}

/// Persisted state of one idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub method: String,
    pub key: String,
    pub digest: String,
    pub status: RecordStatus,
    #[serde(default)]
    pub result: Option<Value>,
    pub created_at: f64,
    pub expires_at: f64,
}

/// What the caller should do after trying to reserve a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The caller owns the key and must `put` or `release` it.
    Acquired,
    /// A completed call already stored this result.
    Replay(Value),
    /// Another caller holds the key right now.
    InFlight,
}

/// Deduplicates calls by `(tenant, method, key)`.
pub struct IdempotencyStore {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    tenant: String,
    ttl: Duration,
    in_flight_lease: Duration,
}

impl IdempotencyStore {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        tenant: impl Into<String>,
        ttl: Duration,
        in_flight_lease: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            tenant: tenant.into(),
            ttl,
            in_flight_lease,
        }
    }

    fn slot_key(&self, method: &str, key: &str) -> String {
        format!("{}|{method}|{key}", self.tenant)
    }

    /// The live record for a key, if any.
    pub fn get(&self, method: &str, key: &str) -> GuardResult<Option<IdempotencyRecord>> {
        let now = self.clock.now();
        let record: Option<IdempotencyRecord> =
            store::get_as(self.store.as_ref(), NAMESPACE, &self.slot_key(method, key))?;
        Ok(record.filter(|r| r.expires_at > now))
    }

    /// Claim a key for a call with parameter digest `digest`.
    pub fn reserve(&self, method: &str, key: &str, digest: &str) -> GuardResult<Reservation> {
        let now = self.clock.now();
        let lease = self.in_flight_lease.as_secs_f64();
        let outcome = store::mutate_as::<IdempotencyRecord, Result<Reservation, String>>(
            self.store.as_ref(),
            NAMESPACE,
            &self.slot_key(method, key),
            |slot| {
                if let Some(record) = slot.as_ref().filter(|r| r.expires_at > now) {
                    if record.digest != digest {
                        return Err("key was used with different parameters".to_string());
                    }
                    return Ok(match (&record.status, &record.result) {
                        (RecordStatus::Done, Some(result)) => Reservation::Replay(result.clone()),
                        _ => Reservation::InFlight,
                    });
                }
                *slot = Some(IdempotencyRecord {
                    method: method.to_string(),
                    key: key.to_string(),
                    digest: digest.to_string(),
                    status: RecordStatus::InProgress,
                    result: None,
                    created_at: now,
                    expires_at: now + lease,
                });
                Ok(Reservation::Acquired)
            },
        )?;
        self.prune();
        outcome.map_err(|reason| conflict(method, key, reason))
    }

    /// Store the result of a completed call. The first stored result wins;
    /// storing a different one for a live key is a conflict.
    pub fn put(&self, method: &str, key: &str, digest: &str, result: &Value) -> GuardResult<Value> {
        let now = self.clock.now();
        let ttl = self.ttl.as_secs_f64();
        let outcome = store::mutate_as::<IdempotencyRecord, Result<Value, String>>(
            self.store.as_ref(),
            NAMESPACE,
            &self.slot_key(method, key),
            |slot| {
                let live = slot.as_ref().filter(|r| r.expires_at > now);
                if let Some(record) = live {
                    if record.digest != digest {
                        return Err("key was used with different parameters".to_string());
                    }
                    if let (RecordStatus::Done, Some(stored)) = (&record.status, &record.result) {
                        if stored != result {
                            return Err("key already holds a different result".to_string());
                        }
                        return Ok(stored.clone());
                    }
                }
                let created_at = live.map_or(now, |r| r.created_at);
                *slot = Some(IdempotencyRecord {
                    method: method.to_string(),
                    key: key.to_string(),
                    digest: digest.to_string(),
                    status: RecordStatus::Done,
                    result: Some(result.clone()),
                    created_at,
                    expires_at: now + ttl,
                });
                Ok(result.clone())
            },
        )?;
        self.prune();
        outcome.map_err(|reason| conflict(method, key, reason))
    }

    /// Drop an in-progress reservation after a failed call.
    pub fn release(&self, method: &str, key: &str) -> GuardResult<()> {
        store::mutate_as::<IdempotencyRecord, ()>(
            self.store.as_ref(),
            NAMESPACE,
            &self.slot_key(method, key),
            |slot| {
                if slot.as_ref().is_some_and(|r| r.status == RecordStatus::InProgress) {
                    *slot = None;
                }
            },
        )?;
        Ok(())
    }

    fn prune(&self) {
        let now = self.clock.now();
        let pruned = self.store.retain(NAMESPACE, &mut |_, value| {
            value
                .get("expires_at")
                .and_then(Value::as_f64)
                .is_some_and(|expires_at| expires_at > now)
        });
        if let Err(e) = pruned {
            tracing::warn!(error = %e, "Failed to prune idempotency records");
        }
    }
}

/// Key taken from well-known parameter fields, matched case-insensitively.
pub fn derive_key(params: &Value) -> Option<String> {
    let map = params.as_object()?;
    KEY_FIELDS.iter().find_map(|field| {
        map.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .and_then(|(_, value)| match value {
                Value::String(s) if !s.trim().is_empty() => Some(format!("{field}:{}", s.trim())),
                Value::Number(n) if n.is_i64() || n.is_u64() => Some(format!("{field}:{n}")),
                _ => None,
            })
    })
}

fn conflict(method: &str, key: &str, reason: String) -> GuardError {
    GuardError::IdempotencyConflict {
        method: method.to_string(),
        key: key.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn fixture() -> (IdempotencyStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = IdempotencyStore::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            "portal",
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        (store, clock)
    }

    #[test]
    fn test_reserve_put_replay() {
        let (store, _) = fixture();
        assert_eq!(store.reserve("crm.lead.add", "k1", "d1").unwrap(), Reservation::Acquired);
        assert_eq!(store.reserve("crm.lead.add", "k1", "d1").unwrap(), Reservation::InFlight);

        store
            .put("crm.lead.add", "k1", "d1", &json!({"result": 42}))
            .unwrap();
        assert_eq!(
            store.reserve("crm.lead.add", "k1", "d1").unwrap(),
            Reservation::Replay(json!({"result": 42}))
        );
        // Same key under another method is independent.
        assert_eq!(store.reserve("crm.deal.add", "k1", "d9").unwrap(), Reservation::Acquired);
    }

    #[test]
    fn test_conflicts() {
        let (store, _) = fixture();
        store.reserve("crm.lead.add", "k1", "d1").unwrap();
        assert!(matches!(
            store.reserve("crm.lead.add", "k1", "other"),
            Err(GuardError::IdempotencyConflict { .. })
        ));

        store.put("crm.lead.add", "k1", "d1", &json!(1)).unwrap();
        assert_eq!(store.put("crm.lead.add", "k1", "d1", &json!(1)).unwrap(), json!(1));
        assert!(matches!(
            store.put("crm.lead.add", "k1", "d1", &json!(2)),
            Err(GuardError::IdempotencyConflict { .. })
        ));
    }

    #[test]
    fn test_expiry_and_release() {
        let (store, clock) = fixture();
        store.reserve("crm.lead.add", "k1", "d1").unwrap();
        store.release("crm.lead.add", "k1").unwrap();
        assert_eq!(store.get("crm.lead.add", "k1").unwrap(), None);

        store.put("crm.lead.add", "k2", "d1", &json!(1)).unwrap();
        store.release("crm.lead.add", "k2").unwrap();
        assert!(store.get("crm.lead.add", "k2").unwrap().is_some());

        clock.advance(Duration::from_secs(3601));
        assert_eq!(store.get("crm.lead.add", "k2").unwrap(), None);
        assert_eq!(store.reserve("crm.lead.add", "k2", "new").unwrap(), Reservation::Acquired);
    }

    #[test]
    fn test_abandoned_reservation_expires() {
        let (store, clock) = fixture();
        store.reserve("crm.lead.add", "k1", "d1").unwrap();
        clock.advance(Duration::from_secs(61));
        assert_eq!(store.reserve("crm.lead.add", "k1", "d1").unwrap(), Reservation::Acquired);
    }

    #[test]
    fn test_derive_key() {
        assert_eq!(
            derive_key(&json!({"ORIGIN_ID": "lead-7", "fields": {}})),
            Some("origin_id:lead-7".to_string())
        );
        assert_eq!(
            derive_key(&json!({"external_id": 12, "idempotency_key": "abc"})),
            Some("idempotency_key:abc".to_string())
        );
        assert_eq!(derive_key(&json!({"fields": {}})), None);
        assert_eq!(derive_key(&json!({"origin_id": ""})), None);
    }
}
