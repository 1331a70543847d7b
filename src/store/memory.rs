//! In-process state store.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::store::{StateStore, StoreResult};

/// State held in a concurrent map keyed by `(namespace, key)`.
///
/// The map entry lock provides the per-key mutual exclusion.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<(String, String), Value>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys across all namespaces.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .entries
            .get(&(namespace.to_string(), key.to_string()))
            .map(|r| r.value().clone()))
    }

    fn mutate(
        &self,
        namespace: &str,
        key: &str,
        f: &mut dyn FnMut(&mut Option<Value>),
    ) -> StoreResult<()> {
        match self.entries.entry((namespace.to_string(), key.to_string())) {
            Entry::Occupied(mut occupied) => {
                let mut slot = Some(occupied.get().clone());
                f(&mut slot);
                match slot {
                    Some(value) => {
                        occupied.insert(value);
                    }
                    None => {
                        occupied.remove();
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let mut slot = None;
                f(&mut slot);
                if let Some(value) = slot {
                    vacant.insert(value);
                }
            }
        }
        Ok(())
    }

    fn scan(&self, namespace: &str) -> StoreResult<Vec<(String, Value)>> {
        Ok(self
            .entries
            .iter()
            .filter(|r| r.key().0 == namespace)
            .map(|r| (r.key().1.clone(), r.value().clone()))
            .collect())
    }

    fn retain(
        &self,
        namespace: &str,
        keep: &mut dyn FnMut(&str, &Value) -> bool,
    ) -> StoreResult<()> {
        self.entries
            .retain(|(ns, key), value| ns != namespace || keep(key, value));
        Ok(())
    }
}
