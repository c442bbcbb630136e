//! Snapshot persistence for caches.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

use tether_cache::RecordCache;

use crate::ServiceError;

/// Broadcast channel capacity for storage change notifications.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Key-value store for cache snapshots.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String);

    /// Receive the key of every entry whose stored value changes.
    ///
    /// `None` when the backend cannot report changes.
    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        None
    }
}

/// In-memory [`Storage`].
#[derive(Debug)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
    changes_tx: broadcast::Sender<String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            changes_tx,
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Writing the value already stored is not reported as a change.
    fn set(&self, key: &str, value: String) {
        let previous = self.entries.insert(key.to_string(), value.clone());
        if previous.as_deref() != Some(value.as_str())
            && self.changes_tx.send(key.to_string()).is_err()
        {
            trace!(key, "no subscribers for storage change");
        }
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.changes_tx.subscribe())
    }
}

/// Load a stored snapshot into the cache, merging with what is cached.
///
/// Returns the number of records loaded; zero if nothing is stored.
pub fn hydrate<S: Storage + ?Sized>(
    cache: &RecordCache,
    storage: &S,
    key: &str,
) -> Result<usize, ServiceError> {
    let Some(snapshot) = storage.get(key) else {
        debug!(key, "no stored snapshot");
        return Ok(0);
    };
    let records: Vec<Value> = serde_json::from_str(&snapshot)?;
    let count = cache.create_many(records)?.len();
    info!(key, count, "cache hydrated from storage");
    Ok(count)
}

/// Write the cache's records, in order, to storage.
pub fn persist<S: Storage + ?Sized>(
    cache: &RecordCache,
    storage: &S,
    key: &str,
) -> Result<usize, ServiceError> {
    let records = cache.records();
    storage.set(key, serde_json::to_string(&records)?);
    trace!(key, count = records.len(), "cache persisted");
    Ok(records.len())
}

/// Persist the cache after every change until shutdown.
pub async fn sync_to_storage<S: Storage + ?Sized>(
    cache: &RecordCache,
    storage: &S,
    key: &str,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ServiceError> {
    let mut updates = cache.subscribe();

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(key, "storage sync stopped");
                    return Ok(());
                }
            }

            update = updates.recv() => match update {
                Ok(_) => {
                    persist(cache, storage, key)?;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(key, missed, "storage sync lagged, persisting full snapshot");
                    persist(cache, storage, key)?;
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// Hydrate the cache whenever the stored snapshot changes, until shutdown.
///
/// Returns immediately if the storage cannot report changes. A corrupt
/// snapshot is logged and skipped.
pub async fn watch_storage<S: Storage + ?Sized>(
    cache: &RecordCache,
    storage: &S,
    key: &str,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ServiceError> {
    let Some(mut changes) = storage.subscribe() else {
        debug!(key, "storage does not report changes");
        return Ok(());
    };

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(key, "storage watch stopped");
                    return Ok(());
                }
            }

            change = changes.recv() => match change {
                Ok(changed_key) if changed_key == key => rehydrate(cache, storage, key),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(key, missed, "storage watch lagged, rehydrating");
                    rehydrate(cache, storage, key);
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

fn rehydrate<S: Storage + ?Sized>(cache: &RecordCache, storage: &S, key: &str) {
    if let Err(e) = hydrate(cache, storage, key) {
        warn!(key, error = %e, "failed to hydrate from changed snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tether_cache::{CacheConfig, RecordId};

    #[test]
    fn test_persist_then_hydrate_preserves_order() {
        let storage = MemoryStorage::new();
        let source = RecordCache::new(CacheConfig::default()).unwrap();
        source.create(json!({"id": 2, "name": "b"})).unwrap();
        source.create(json!({"id": 1, "name": "a"})).unwrap();
        assert_eq!(persist(&source, &storage, "todos").unwrap(), 2);

        let target = RecordCache::new(CacheConfig::default()).unwrap();
        assert_eq!(hydrate(&target, &storage, "todos").unwrap(), 2);
        assert_eq!(target.ids(), vec![RecordId::Int(2), RecordId::Int(1)]);
    }

    #[test]
    fn test_hydrate_missing_key() {
        let storage = MemoryStorage::new();
        let cache = RecordCache::new(CacheConfig::default()).unwrap();
        assert_eq!(hydrate(&cache, &storage, "absent").unwrap(), 0);
    }

    #[test]
    fn test_hydrate_rejects_corrupt_snapshot() {
        let storage = MemoryStorage::new();
        storage.set("todos", "{not json".to_string());
        let cache = RecordCache::new(CacheConfig::default()).unwrap();
        assert!(matches!(
            hydrate(&cache, &storage, "todos"),
            Err(ServiceError::Json(_))
        ));

        storage.set("todos", r#"[{"id": 1}, {"name": "no id"}]"#.to_string());
        assert!(matches!(
            hydrate(&cache, &storage, "todos"),
            Err(ServiceError::Cache(_))
        ));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sync_persists_changes() {
        let storage = std::sync::Arc::new(MemoryStorage::new());
        let cache = RecordCache::new(CacheConfig::default()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let cache = std::sync::Arc::clone(&cache);
            let storage = std::sync::Arc::clone(&storage);
            tokio::spawn(async move {
                sync_to_storage(&cache, storage.as_ref(), "todos", shutdown_rx).await
            })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        cache.create(json!({"id": 1})).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(storage.get("todos").as_deref(), Some(r#"[{"id":1}]"#));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_memory_storage_reports_changed_keys() {
        let storage = MemoryStorage::new();
        let mut changes = storage.subscribe().unwrap();

        storage.set("todos", "[]".to_string());
        storage.set("todos", "[]".to_string());
        storage.set("users", "[]".to_string());

        assert_eq!(changes.try_recv().unwrap(), "todos");
        assert_eq!(changes.try_recv().unwrap(), "users");
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watch_hydrates_on_external_change() {
        let storage = std::sync::Arc::new(MemoryStorage::new());
        let cache = RecordCache::new(CacheConfig::default()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let cache = std::sync::Arc::clone(&cache);
            let storage = std::sync::Arc::clone(&storage);
            tokio::spawn(async move {
                watch_storage(&cache, storage.as_ref(), "todos", shutdown_rx).await
            })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Another writer replaces the snapshot; unrelated keys are ignored.
        storage.set("users", r#"[{"id": 9}]"#.to_string());
        storage.set("todos", "{corrupt".to_string());
        storage.set("todos", r#"[{"id": 1, "title": "a"}]"#.to_string());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.records(), vec![json!({"id": 1, "title": "a"})]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
