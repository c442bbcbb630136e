//! Cache-backed service actions.
//!
//! Each write is applied to the cache before the request goes out (when
//! optimistic), arms the event lock that suppresses the server's realtime
//! echo, and is rolled back if the request fails.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use tether_cache::{CacheError, EventKind, OperationKind, RecordCache, RecordId, Settled};

use crate::client::{FindResult, ServiceClient};
use crate::config::{ServiceConfig, TEMP_ID_FIELD};
use crate::storage::{self, Storage};
use crate::{ClientError, ServiceError};

/// A remote service mirrored into a [`RecordCache`].
pub struct Service<C> {
    client: C,
    cache: Arc<RecordCache>,
    config: ServiceConfig,
}

impl<C: ServiceClient> Service<C> {
    /// Create a service with a fresh cache.
    pub fn new(client: C, config: ServiceConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let cache = RecordCache::new(config.cache.clone())?;
        Ok(Self {
            client,
            cache,
            config,
        })
    }

    /// Create a service over an existing cache.
    pub fn with_cache(
        client: C,
        cache: Arc<RecordCache>,
        config: ServiceConfig,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        Ok(Self {
            client,
            cache,
            config,
        })
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Run a remote query and cache every returned record.
    #[tracing::instrument(skip(self, params))]
    pub async fn find(&self, params: &Value) -> Result<FindResult, ServiceError> {
        let _tracking = self.cache.find_pending().track();
        let result = self.client.find(params).await?;
        self.cache.create_many(result.data.iter().cloned())?;
        debug!(count = result.data.len(), total = result.total, "find results cached");
        Ok(result)
    }

    /// Fetch a record from the server and cache it.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub async fn get(&self, id: &RecordId) -> Result<Value, ServiceError> {
        let _tracking = self.cache.get_pending().track();
        let record = self.client.get(id).await?;
        Ok(self.cache.create(record)?)
    }

    /// Return the cached record, fetching it only when it is not cached.
    pub async fn get_or_fetch(&self, id: &RecordId) -> Result<Value, ServiceError> {
        match self.cache.get(id) {
            Some(record) => Ok(record),
            None => self.get(id).await,
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Create a record on the server.
    ///
    /// A record without an identity is mirrored under a temporary one until
    /// the server assigns its own.
    #[tracing::instrument(skip(self, data))]
    pub async fn create(&self, data: Value) -> Result<Value, ServiceError> {
        let _pending = self.cache.begin_pending(OperationKind::Create);
        match self.cache.identity_of(&data) {
            Some(id) => self.create_identified(id, data).await,
            None => self.create_unsaved(data).await,
        }
    }

    async fn create_identified(&self, id: RecordId, data: Value) -> Result<Value, ServiceError> {
        let snapshot = self.snapshot(&id);
        if self.config.optimistic {
            self.cache.create(data.clone())?;
        }
        self.cache.arm_lock([id.clone()], EventKind::Created);

        match self.client.create(data).await {
            Ok(server) => Ok(self.cache.create(server)?),
            Err(e) => {
                self.cache.clear_lock([id.clone()], EventKind::Created);
                if self.config.optimistic {
                    match snapshot {
                        Some((index, record)) => self.roll_back(&id, index, record),
                        None => {
                            self.cache.remove(&id);
                        }
                    }
                }
                Err(self.failed(OperationKind::Create, &id, e))
            }
        }
    }

    async fn create_unsaved(&self, data: Value) -> Result<Value, ServiceError> {
        let temp_id = RecordId::Str(Uuid::new_v4().to_string());
        if self.config.optimistic {
            let placeholder = self.with_temp_identity(&data, &temp_id)?;
            self.cache.create(placeholder)?;
            debug!(temp_id = %temp_id, "unsaved record mirrored");
        }

        let result = self.client.create(data).await;
        if self.config.optimistic {
            self.cache.remove(&temp_id);
        }
        match result {
            Ok(server) => Ok(self.cache.create(server)?),
            Err(e) => Err(self.failed(OperationKind::Create, &temp_id, e)),
        }
    }

    /// Merge `changes` into a cached record on the server.
    ///
    /// # Errors
    ///
    /// `NotFound` without dispatching if the record is not cached.
    #[tracing::instrument(skip(self, changes), fields(id = %id))]
    pub async fn patch(&self, id: &RecordId, changes: Value) -> Result<Value, ServiceError> {
        let _pending = self.cache.begin_pending(OperationKind::Patch);
        let (index, snapshot) = self
            .snapshot(id)
            .ok_or_else(|| CacheError::NotFound { id: id.clone() })?;
        if self.config.optimistic {
            self.cache.patch(id, changes.clone())?;
        }
        self.cache.arm_lock([id.clone()], EventKind::Patched);

        match self.client.patch(id, changes).await {
            Ok(server) => Ok(self.cache.create(server)?),
            Err(e) => {
                self.cache.clear_lock([id.clone()], EventKind::Patched);
                if self.config.optimistic {
                    self.roll_back(id, index, snapshot);
                }
                Err(self.failed(OperationKind::Patch, id, e))
            }
        }
    }

    /// Replace a cached record on the server.
    ///
    /// # Errors
    ///
    /// `NotFound` without dispatching if the record is not cached.
    #[tracing::instrument(skip(self, data), fields(id = %id))]
    pub async fn update(&self, id: &RecordId, data: Value) -> Result<Value, ServiceError> {
        let _pending = self.cache.begin_pending(OperationKind::Update);
        let (index, snapshot) = self
            .snapshot(id)
            .ok_or_else(|| CacheError::NotFound { id: id.clone() })?;
        if self.config.optimistic {
            self.cache.update(id, data.clone())?;
        }
        self.cache.arm_lock([id.clone()], EventKind::Updated);

        match self.client.update(id, data).await {
            Ok(server) => Ok(self.replace(id, server)?),
            Err(e) => {
                self.cache.clear_lock([id.clone()], EventKind::Updated);
                if self.config.optimistic {
                    self.roll_back(id, index, snapshot);
                }
                Err(self.failed(OperationKind::Update, id, e))
            }
        }
    }

    /// Delete a record on the server. Uncached records are still dispatched.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub async fn remove(&self, id: &RecordId) -> Result<Value, ServiceError> {
        let _pending = self.cache.begin_pending(OperationKind::Remove);
        let removed = if self.config.optimistic {
            self.cache.remove_entry(id)
        } else {
            None
        };
        self.cache.arm_lock([id.clone()], EventKind::Removed);

        match self.client.remove(id).await {
            Ok(server) => {
                self.cache.remove(id);
                Ok(server)
            }
            Err(e) => {
                self.cache.clear_lock([id.clone()], EventKind::Removed);
                if let Some((index, record)) = removed {
                    self.roll_back(id, index, record);
                }
                Err(self.failed(OperationKind::Remove, id, e))
            }
        }
    }

    /// Future resolving once no write of `kind` is in flight.
    pub fn await_settled(&self, kind: OperationKind) -> Settled {
        self.cache.await_settled(kind)
    }

    // =========================================================================
    // Storage
    // =========================================================================

    /// Load the snapshot stored under the configured storage key.
    pub fn hydrate<S: Storage + ?Sized>(&self, storage: &S) -> Result<usize, ServiceError> {
        storage::hydrate(&self.cache, storage, self.storage_key()?)
    }

    /// Write the cache to the configured storage key.
    pub fn persist<S: Storage + ?Sized>(&self, storage: &S) -> Result<usize, ServiceError> {
        storage::persist(&self.cache, storage, self.storage_key()?)
    }

    /// Keep the cache and the configured storage key in step until shutdown.
    ///
    /// Cache changes are persisted, and changes to the stored snapshot are
    /// hydrated back into the cache.
    pub async fn sync_storage<S: Storage + ?Sized>(
        &self,
        storage: &S,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ServiceError> {
        let key = self.storage_key()?;
        let (persisted, watched) = tokio::join!(
            storage::sync_to_storage(&self.cache, storage, key, shutdown_rx.clone()),
            storage::watch_storage(&self.cache, storage, key, shutdown_rx),
        );
        persisted.and(watched)
    }

    fn storage_key(&self) -> Result<&str, ServiceError> {
        self.config
            .storage_key
            .as_deref()
            .ok_or_else(|| ServiceError::Config("no storage key configured".to_string()))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn snapshot(&self, id: &RecordId) -> Option<(usize, Value)> {
        let index = self.cache.position(id)?;
        self.cache.get(id).map(|record| (index, record))
    }

    fn with_temp_identity(&self, data: &Value, temp_id: &RecordId) -> Result<Value, CacheError> {
        let mut fields: Map<String, Value> = match data {
            Value::Object(fields) => fields.clone(),
            other => {
                return Err(CacheError::InvalidRecord(format!(
                    "expected an object, got {}",
                    other
                )));
            }
        };
        fields.insert(TEMP_ID_FIELD.to_string(), temp_id.to_value());
        fields.insert(self.cache.id_field().to_string(), temp_id.to_value());
        Ok(Value::Object(fields))
    }

    /// Replace with the server copy, inserting it if the record was removed
    /// in the meantime.
    fn replace(&self, id: &RecordId, server: Value) -> Result<Value, CacheError> {
        match self.cache.update(id, server.clone()) {
            Err(CacheError::NotFound { .. }) => self.cache.create(server),
            result => result,
        }
    }

    fn roll_back(&self, id: &RecordId, index: usize, record: Value) {
        if let Err(e) = self.cache.restore(index, record) {
            warn!(id = %id, error = %e, "failed to roll back optimistic change");
        }
    }

    fn failed(&self, kind: OperationKind, id: &RecordId, error: ClientError) -> ServiceError {
        if self.config.optimistic {
            warn!(
                operation = %kind,
                id = %id,
                error = %error,
                "request failed, local change rolled back"
            );
        } else {
            warn!(operation = %kind, id = %id, error = %error, "request failed");
        }
        ServiceError::Client(error)
    }
}
