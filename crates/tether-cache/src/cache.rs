//! In-memory record cache.
//!
//! Holds the ordered, identity-indexed mirror of server records, applies
//! local CRUD operations and realtime events, and exposes pending
//! indicators for in-flight writes.

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use indexmap::map::Entry;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::counter::Counter;
use crate::events::{EventKind, EventOutcome, OperationKind, RealtimeEvent};
use crate::locks::EventLocks;
use crate::pending::{PendingRegistry, PendingSource, Settled};
use crate::query::{self, LocalQuery, Page};
use crate::record::{self, RecordId};
use crate::CacheError;

/// Update event for cache subscribers.
///
/// Sent before the mutating call returns.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// A record was added.
    Created { id: RecordId, record: Value },
    /// A create hit an existing record and was merged into it.
    Merged { id: RecordId, record: Value },
    /// A record was patched.
    Patched { id: RecordId, record: Value },
    /// A record was replaced.
    Updated { id: RecordId, record: Value },
    /// A record was removed.
    Removed { id: RecordId, record: Value },
    /// The collection was emptied.
    Cleared,
}

/// Boolean indicator that stays true while any operation of its kind runs.
struct Indicator {
    inflight: Mutex<usize>,
    pending_tx: watch::Sender<bool>,
}

impl Indicator {
    fn new() -> Self {
        let (pending_tx, _) = watch::channel(false);
        Self {
            inflight: Mutex::new(0),
            pending_tx,
        }
    }
}

/// In-memory cache for one service's records.
///
/// Thread-safe; collection reads and writes never suspend, so the ordered
/// sequence and the identity index are always observed together.
pub struct RecordCache {
    config: CacheConfig,
    /// Records in insertion order, indexed by identity.
    records: RwLock<IndexMap<RecordId, Value>>,
    locks: EventLocks,
    pending: PendingRegistry,
    indicators: [Indicator; 4],
    find_pending: Counter,
    get_pending: Counter,
    updates_tx: broadcast::Sender<CacheUpdate>,
}

impl RecordCache {
    /// Create a new empty cache.
    pub fn new(config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        config.validate()?;
        Ok(Arc::new(Self::build(config)))
    }

    fn build(config: CacheConfig) -> Self {
        let (updates_tx, _) = broadcast::channel(config.update_capacity);
        Self {
            locks: EventLocks::new(config.lock_timeout()),
            config,
            records: RwLock::new(IndexMap::new()),
            pending: PendingRegistry::new(),
            indicators: [
                Indicator::new(),
                Indicator::new(),
                Indicator::new(),
                Indicator::new(),
            ],
            find_pending: Counter::new("find"),
            get_pending: Counter::new("get"),
            updates_tx,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Name of the identity field.
    pub fn id_field(&self) -> &str {
        &self.config.id_field
    }

    /// Read the identity of `record` using this cache's identity field.
    pub fn identity_of(&self, record: &Value) -> Option<RecordId> {
        record::identity_of(record, &self.config.id_field)
    }

    /// Subscribe to cache updates.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    // A panic while a guard is held leaves the collection as it was before
    // the panicking call, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, IndexMap<RecordId, Value>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexMap<RecordId, Value>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, update: CacheUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for cache update");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a record by identity.
    pub fn get(&self, id: &RecordId) -> Option<Value> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.read().contains_key(id)
    }

    /// Get the number of cached records.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Identities in collection order.
    pub fn ids(&self) -> Vec<RecordId> {
        self.read().keys().cloned().collect()
    }

    /// Records in collection order.
    pub fn records(&self) -> Vec<Value> {
        self.read().values().cloned().collect()
    }

    /// Position of a record in the collection.
    pub fn position(&self, id: &RecordId) -> Option<usize> {
        self.read().get_index_of(id)
    }

    /// Run a local query over a snapshot of the collection.
    ///
    /// No lock is held while the query runs, so it may call back into the
    /// cache.
    pub fn find<Q: LocalQuery + ?Sized>(&self, query: &Q) -> Page {
        let records = self.records();
        query::run(query, records.iter())
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert a record, or merge its fields into the cached record with the
    /// same identity.
    ///
    /// Returns the stored record.
    pub fn create(&self, record: Value) -> Result<Value, CacheError> {
        let (id, fields) = self.split(record)?;
        Ok(self.upsert(id, fields))
    }

    /// Create or merge a batch of records.
    ///
    /// Every record is validated before any is stored, so a bad record
    /// leaves the collection untouched.
    pub fn create_many(
        &self,
        records: impl IntoIterator<Item = Value>,
    ) -> Result<Vec<Value>, CacheError> {
        let batch = records
            .into_iter()
            .map(|record| self.split(record))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(batch
            .into_iter()
            .map(|(id, fields)| self.upsert(id, fields))
            .collect())
    }

    /// Shallow-merge `changes` into a cached record, in place.
    ///
    /// # Errors
    ///
    /// `NotFound` if the identity is not cached; `IdentityMismatch` if the
    /// changes carry a different identity. Nothing is mutated on error.
    pub fn patch(&self, id: &RecordId, changes: Value) -> Result<Value, CacheError> {
        let changes = record::fields(changes)?;
        record::check_identity(&changes, &self.config.id_field, id)?;

        let stored = {
            let mut records = self.write();
            let cached = records
                .get_mut(id)
                .ok_or_else(|| CacheError::NotFound { id: id.clone() })?;
            record::merge_into(cached, changes);
            cached.clone()
        };

        trace!(id = %id, "cache: record patched");
        self.broadcast(CacheUpdate::Patched {
            id: id.clone(),
            record: stored.clone(),
        });
        Ok(stored)
    }

    /// Replace every field of a cached record, in place.
    ///
    /// # Errors
    ///
    /// Same as [`patch`](Self::patch).
    pub fn update(&self, id: &RecordId, replacement: Value) -> Result<Value, CacheError> {
        let replacement = record::fields(replacement)?;
        record::check_identity(&replacement, &self.config.id_field, id)?;

        let stored = {
            let mut records = self.write();
            let cached = records
                .get_mut(id)
                .ok_or_else(|| CacheError::NotFound { id: id.clone() })?;
            record::replace_fields(cached, replacement, &self.config.id_field, id);
            cached.clone()
        };

        trace!(id = %id, "cache: record updated");
        self.broadcast(CacheUpdate::Updated {
            id: id.clone(),
            record: stored.clone(),
        });
        Ok(stored)
    }

    /// Remove a record. A no-op if it is not cached.
    pub fn remove(&self, id: &RecordId) -> Option<Value> {
        self.remove_entry(id).map(|(_, record)| record)
    }

    /// Remove a record, returning its former position as well.
    pub fn remove_entry(&self, id: &RecordId) -> Option<(usize, Value)> {
        let removed = self
            .write()
            .shift_remove_full(id)
            .map(|(index, _, record)| (index, record));

        if let Some((_, ref record)) = removed {
            trace!(id = %id, "cache: record removed");
            self.broadcast(CacheUpdate::Removed {
                id: id.clone(),
                record: record.clone(),
            });
        }
        removed
    }

    /// Put a record back at `index`, e.g. to roll back a failed removal.
    ///
    /// A record that is already cached is replaced where it stands.
    pub fn restore(&self, index: usize, record: Value) -> Result<Value, CacheError> {
        let (id, fields) = self.split(record)?;
        let stored = Value::Object(fields);

        let existed = {
            let mut records = self.write();
            match records.get_mut(&id) {
                Some(cached) => {
                    *cached = stored.clone();
                    true
                }
                None => {
                    let index = index.min(records.len());
                    records.shift_insert(index, id.clone(), stored.clone());
                    false
                }
            }
        };

        trace!(id = %id, index, "cache: record restored");
        let update = if existed {
            CacheUpdate::Updated {
                id,
                record: stored.clone(),
            }
        } else {
            CacheUpdate::Created {
                id,
                record: stored.clone(),
            }
        };
        self.broadcast(update);
        Ok(stored)
    }

    /// Empty the collection.
    pub fn clear_all(&self) {
        let count = {
            let mut records = self.write();
            let count = records.len();
            records.clear();
            count
        };
        debug!(count, "cache cleared");
        self.broadcast(CacheUpdate::Cleared);
    }

    /// Apply a realtime event.
    ///
    /// An event matching a held lock is the echo of a local mutation: it is
    /// skipped and the lock is consumed. Anything else is authoritative;
    /// `updated` and `patched` events for uncached records insert them.
    pub fn apply_event(&self, event: RealtimeEvent) -> Result<EventOutcome, CacheError> {
        if self.consume_echo(&event)? {
            return Ok(EventOutcome::Skipped);
        }
        self.apply_authoritative(event)?;
        Ok(EventOutcome::Applied)
    }

    /// Consume the lock matching `event`, reporting whether the event is an
    /// echo of a local mutation.
    ///
    /// A malformed event errors without consuming anything.
    pub fn consume_echo(&self, event: &RealtimeEvent) -> Result<bool, CacheError> {
        let id = self.event_identity(event)?;
        if self.locks.take(event.kind, &id) {
            debug!(kind = %event.kind, id = %id, "skipping realtime echo");
            return Ok(true);
        }
        Ok(false)
    }

    /// Apply `event` without consulting the event locks.
    pub fn apply_authoritative(&self, event: RealtimeEvent) -> Result<(), CacheError> {
        let RealtimeEvent { kind, payload } = event;
        match kind {
            EventKind::Removed => {
                let id = RecordId::from_value(&payload)
                    .or_else(|| self.identity_of(&payload))
                    .ok_or_else(|| self.missing_identity())?;
                self.remove(&id);
            }
            EventKind::Updated => {
                let (id, fields) = self.split(payload)?;
                self.replace_or_insert(id, fields);
            }
            EventKind::Created | EventKind::Patched => {
                let (id, fields) = self.split(payload)?;
                self.upsert(id, fields);
            }
        }
        trace!(kind = %kind, "applied realtime event");
        Ok(())
    }

    /// Identity an event refers to, validating the payload shape for its kind.
    fn event_identity(&self, event: &RealtimeEvent) -> Result<RecordId, CacheError> {
        match (event.kind, &event.payload) {
            (EventKind::Removed, _) => event
                .identity(&self.config.id_field)
                .ok_or_else(|| self.missing_identity()),
            (_, Value::Object(_)) => self
                .identity_of(&event.payload)
                .ok_or_else(|| self.missing_identity()),
            (_, other) => Err(CacheError::InvalidRecord(format!(
                "expected a JSON object, got {}",
                record::kind_name(other)
            ))),
        }
    }

    fn split(&self, record: Value) -> Result<(RecordId, Map<String, Value>), CacheError> {
        let fields = record::fields(record)?;
        let id = fields
            .get(&self.config.id_field)
            .and_then(RecordId::from_value)
            .ok_or_else(|| self.missing_identity())?;
        Ok((id, fields))
    }

    fn missing_identity(&self) -> CacheError {
        CacheError::MissingIdentity {
            field: self.config.id_field.clone(),
        }
    }

    fn upsert(&self, id: RecordId, fields: Map<String, Value>) -> Value {
        let (stored, merged) = {
            let mut records = self.write();
            match records.entry(id.clone()) {
                Entry::Occupied(mut entry) => {
                    record::merge_into(entry.get_mut(), fields);
                    (entry.get().clone(), true)
                }
                Entry::Vacant(entry) => (entry.insert(Value::Object(fields)).clone(), false),
            }
        };

        let update = if merged {
            trace!(id = %id, "cache: record merged");
            CacheUpdate::Merged {
                id,
                record: stored.clone(),
            }
        } else {
            trace!(id = %id, "cache: record created");
            CacheUpdate::Created {
                id,
                record: stored.clone(),
            }
        };
        self.broadcast(update);
        stored
    }

    fn replace_or_insert(&self, id: RecordId, fields: Map<String, Value>) {
        let (stored, existed) = {
            let mut records = self.write();
            match records.entry(id.clone()) {
                Entry::Occupied(mut entry) => {
                    record::replace_fields(entry.get_mut(), fields, &self.config.id_field, &id);
                    (entry.get().clone(), true)
                }
                Entry::Vacant(entry) => (entry.insert(Value::Object(fields)).clone(), false),
            }
        };

        let update = if existed {
            CacheUpdate::Updated { id, record: stored }
        } else {
            CacheUpdate::Created { id, record: stored }
        };
        self.broadcast(update);
    }

    // =========================================================================
    // Event locks
    // =========================================================================

    pub fn locks(&self) -> &EventLocks {
        &self.locks
    }

    /// Arm or release event locks. See [`EventLocks::toggle`].
    pub fn toggle_lock(&self, ids: impl IntoIterator<Item = RecordId>, kind: EventKind) {
        self.locks.toggle(ids, kind);
    }

    /// Hold event locks without releasing any. See [`EventLocks::arm`].
    pub fn arm_lock(&self, ids: impl IntoIterator<Item = RecordId>, kind: EventKind) {
        self.locks.arm(ids, kind);
    }

    /// Remove event locks. See [`EventLocks::clear`].
    pub fn clear_lock(&self, ids: impl IntoIterator<Item = RecordId>, kind: EventKind) {
        self.locks.clear(ids, kind);
    }

    pub fn is_locked(&self, kind: EventKind, id: &RecordId) -> bool {
        self.locks.is_locked(kind, id)
    }

    // =========================================================================
    // Pending state
    // =========================================================================

    /// Mark an operation of `kind` in flight until the guard drops.
    pub fn begin_pending(&self, kind: OperationKind) -> PendingGuard<'_> {
        let indicator = &self.indicators[kind.index()];
        let mut inflight = indicator
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *inflight += 1;
        if *inflight == 1 {
            indicator.pending_tx.send_replace(true);
            debug!(indicator = kind.indicator_name(), "pending");
        }
        PendingGuard { cache: self, kind }
    }

    fn end_pending(&self, kind: OperationKind) {
        let indicator = &self.indicators[kind.index()];
        let mut inflight = indicator
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *inflight == 0 {
            return;
        }
        *inflight -= 1;
        if *inflight == 0 {
            indicator.pending_tx.send_replace(false);
            debug!(indicator = kind.indicator_name(), "settled");
        }
    }

    /// Whether an operation of `kind` is in flight.
    pub fn is_pending(&self, kind: OperationKind) -> bool {
        *self.indicators[kind.index()].pending_tx.borrow()
    }

    /// Outstanding find queries.
    pub fn find_pending(&self) -> &Counter {
        &self.find_pending
    }

    /// Outstanding single-record fetches.
    pub fn get_pending(&self) -> &Counter {
        &self.get_pending
    }

    /// Future resolving once no operation of `kind` is in flight.
    ///
    /// Concurrent callers share one future until it resolves.
    pub fn await_settled(&self, kind: OperationKind) -> Settled {
        self.pending.await_settled(self, kind)
    }

    /// Forget all settle futures. Unresolved ones never resolve.
    pub fn reset_pending(&self) {
        self.pending.reset();
    }
}

impl PendingSource for RecordCache {
    fn watch_pending(&self, kind: OperationKind) -> watch::Receiver<bool> {
        self.indicators[kind.index()].pending_tx.subscribe()
    }
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::build(CacheConfig::default())
    }
}

/// Keeps an operation kind's pending indicator raised while alive.
#[must_use = "the operation is marked settled as soon as the guard is dropped"]
pub struct PendingGuard<'a> {
    cache: &'a RecordCache,
    kind: OperationKind,
}

impl PendingGuard<'_> {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.cache.end_pending(self.kind);
    }
}
