//! Persisted state subsystem.
//!
//! # Data Flow
//! ```text
//! rate limiter / plans / idempotency / dead letters / credentials
//!     → typed helpers (get_as, mutate_as)
//!     → StateStore (namespace + key)
//!     → memory.rs (DashMap entry lock) or file.rs (flock on namespace file)
//! ```
//!
//! # Design Decisions
//! - Every mutation is a read-modify-write under a lock scoped to one key
//! - Mutation callbacks must not touch the store again (no nested locks)
//! - Unreadable documents are treated as empty, never as fatal

pub mod file;
pub mod memory;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::schema::{StorageBackend, StorageConfig};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Errors raised by state store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading, locking or writing the backing file failed.
    #[error("state store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another holder kept the file lock past the wait bound.
    #[error("timed out after {waited_ms}ms waiting for the lock on {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// A value could not be encoded for storage.
    #[error("state store encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Key-scoped JSON state shared by all components.
pub trait StateStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Read-modify-write the value under `key` while holding its lock.
    ///
    /// Setting the slot to `None` removes the key.
    fn mutate(
        &self,
        namespace: &str,
        key: &str,
        f: &mut dyn FnMut(&mut Option<Value>),
    ) -> StoreResult<()>;

    /// Snapshot every key in a namespace.
    fn scan(&self, namespace: &str) -> StoreResult<Vec<(String, Value)>>;

    /// Drop every entry of a namespace for which `keep` returns false.
    fn retain(
        &self,
        namespace: &str,
        keep: &mut dyn FnMut(&str, &Value) -> bool,
    ) -> StoreResult<()>;
}

/// Read and decode a typed value. Undecodable values read as absent.
pub fn get_as<T: DeserializeOwned>(
    store: &dyn StateStore,
    namespace: &str,
    key: &str,
) -> StoreResult<Option<T>> {
    Ok(store
        .get(namespace, key)?
        .and_then(|value| serde_json::from_value(value).ok()))
}

/// Typed read-modify-write. The callback's return value is passed through.
pub fn mutate_as<T, R>(
    store: &dyn StateStore,
    namespace: &str,
    key: &str,
    f: impl FnOnce(&mut Option<T>) -> R,
) -> StoreResult<R>
where
    T: Serialize + DeserializeOwned,
{
    let mut f = Some(f);
    let mut output = None;
    let mut encode_error = None;

    store.mutate(namespace, key, &mut |slot| {
        let Some(f) = f.take() else { return };
        let mut typed: Option<T> = slot
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok());
        output = Some(f(&mut typed));
        match typed.map(serde_json::to_value).transpose() {
            Ok(encoded) => *slot = encoded,
            Err(e) => encode_error = Some(e),
        }
    })?;

    if let Some(e) = encode_error {
        return Err(StoreError::Encode(e));
    }
    // The backend always runs the callback exactly once.
    output.ok_or_else(|| {
        StoreError::Io {
            path: PathBuf::from(namespace),
            source: std::io::Error::other("mutation callback was not invoked"),
        }
    })
}

/// Open the backend selected by configuration.
pub fn open(config: &StorageConfig) -> Arc<dyn StateStore> {
    match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => Arc::new(
            FileStore::new(&config.state_dir)
                .with_lock_timeout(Duration::from_millis(config.lock_timeout_ms)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Counter {
        hits: u32,
    }

    #[test]
    fn test_mutate_as_round_trips_through_backend() {
        let store = MemoryStore::new();
        let first = mutate_as::<Counter, u32>(&store, "counters", "a", |slot| {
            let counter = slot.get_or_insert(Counter { hits: 0 });
            counter.hits += 1;
            counter.hits
        })
        .unwrap();
        let second = mutate_as::<Counter, u32>(&store, "counters", "a", |slot| {
            let counter = slot.get_or_insert(Counter { hits: 0 });
            counter.hits += 1;
            counter.hits
        })
        .unwrap();

        assert_eq!((first, second), (1, 2));
        let stored: Counter = get_as(&store, "counters", "a").unwrap().unwrap();
        assert_eq!(stored, Counter { hits: 2 });
    }

    #[test]
    fn test_mutate_as_treats_garbage_as_absent() {
        let store = MemoryStore::new();
        store
            .mutate("counters", "a", &mut |slot| *slot = Some(Value::String("junk".into())))
            .unwrap();

        let seen_absent =
            mutate_as::<Counter, bool>(&store, "counters", "a", |slot| slot.is_none()).unwrap();
        assert!(seen_absent);
    }
}
