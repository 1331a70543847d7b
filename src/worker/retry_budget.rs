//! Persisted per-item failure counters.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::GuardResult;
use crate::store::{self, StateStore};

const NAMESPACE: &str = "offline_retries";

/// Failure history of one queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub count: u32,
    pub first_seen: f64,
    pub last_seen: f64,
    pub last_error: String,
}

/// Counts failures per item identity across cycles and restarts.
pub struct RetryBudget {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    tenant: String,
    max_retries: u32,
}

impl RetryBudget {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        tenant: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            tenant: tenant.into(),
            max_retries: max_retries.max(1),
        }
    }

    fn slot_key(&self, identity: &str) -> String {
        format!("{}|{identity}", self.tenant)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Record one more failure and return the updated history.
    pub fn fail(&self, identity: &str, error: &str) -> GuardResult<RetryRecord> {
        let now = self.clock.now();
        let record = store::mutate_as::<RetryRecord, RetryRecord>(
            self.store.as_ref(),
            NAMESPACE,
            &self.slot_key(identity),
            |slot| {
                let record = slot.get_or_insert_with(|| RetryRecord {
                    count: 0,
                    first_seen: now,
                    last_seen: now,
                    last_error: String::new(),
                });
                record.count += 1;
                record.last_seen = now;
                record.last_error = error.to_string();
                record.clone()
            },
        )?;
        Ok(record)
    }

    pub fn clear(&self, identity: &str) -> GuardResult<()> {
        store::mutate_as::<RetryRecord, ()>(
            self.store.as_ref(),
            NAMESPACE,
            &self.slot_key(identity),
            |slot| *slot = None,
        )?;
        Ok(())
    }

    pub fn get(&self, identity: &str) -> GuardResult<Option<RetryRecord>> {
        Ok(store::get_as(self.store.as_ref(), NAMESPACE, &self.slot_key(identity))?)
    }

    pub fn is_exhausted(&self, record: &RetryRecord) -> bool {
        record.count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[test]
    fn test_fail_counts_and_clear() {
        let clock = Arc::new(ManualClock::new(100.0));
        let budget = RetryBudget::new(Arc::new(MemoryStore::new()), clock.clone(), "portal", 3);

        let first = budget.fail("m1", "boom").unwrap();
        assert_eq!(first.count, 1);
        assert!(!budget.is_exhausted(&first));

        clock.advance(Duration::from_secs(5));
        budget.fail("m1", "boom").unwrap();
        let third = budget.fail("m1", "still broken").unwrap();
        assert_eq!(third.count, 3);
        assert_eq!(third.first_seen, 100.0);
        assert_eq!(third.last_seen, 105.0);
        assert_eq!(third.last_error, "still broken");
        assert!(budget.is_exhausted(&third));

        budget.clear("m1").unwrap();
        assert_eq!(budget.get("m1").unwrap(), None);
    }

    #[test]
    fn test_tenants_are_separate() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let a = RetryBudget::new(store.clone(), clock.clone(), "a", 3);
        let b = RetryBudget::new(store, clock, "b", 3);
        a.fail("m1", "x").unwrap();
        assert_eq!(b.get("m1").unwrap(), None);
    }
}
