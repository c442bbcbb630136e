//! Per-record event locks with automatic expiry.
//!
//! A lock for `(kind, id)` marks an echo of a local mutation as expected.
//! Locks are armed before a local mutation is dispatched and released when
//! the matching realtime event arrives, when toggled again, when cleared,
//! or when the lock timeout elapses, whichever comes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::trace;

use crate::events::EventKind;
use crate::record::RecordId;
use crate::timer::ScheduledTask;

/// Broadcast channel capacity for lock notifications.
const LOCK_CHANNEL_CAPACITY: usize = 1024;

/// Why a lock was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Toggled a second time.
    Toggled,
    /// Cleared explicitly.
    Cleared,
    /// Consumed by a matching realtime event.
    Consumed,
    /// Timed out.
    Expired,
}

/// Notification for lock observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockUpdate {
    Armed {
        kind: EventKind,
        id: RecordId,
    },
    Released {
        kind: EventKind,
        id: RecordId,
        reason: ReleaseReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LockKey {
    kind: EventKind,
    id: RecordId,
}

#[derive(Debug)]
struct LockEntry {
    /// Distinguishes successive armings of the same key, so a late expiry
    /// never removes a newer lock.
    generation: u64,
    expiry: ScheduledTask,
}

/// Table of active event locks.
///
/// Arming a lock spawns its expiry task, so [`toggle`](Self::toggle) must be
/// called from within a Tokio runtime.
pub struct EventLocks {
    timeout: Duration,
    entries: Arc<DashMap<LockKey, LockEntry>>,
    generation: AtomicU64,
    updates_tx: broadcast::Sender<LockUpdate>,
}

impl EventLocks {
    /// Create an empty lock table with the given expiry.
    pub fn new(timeout: Duration) -> Self {
        let (updates_tx, _) = broadcast::channel(LOCK_CHANNEL_CAPACITY);
        Self {
            timeout,
            entries: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            updates_tx,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Subscribe to lock notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LockUpdate> {
        self.updates_tx.subscribe()
    }

    /// Whether a lock is held for `(kind, id)`.
    pub fn is_locked(&self, kind: EventKind, id: &RecordId) -> bool {
        self.entries.contains_key(&LockKey {
            kind,
            id: id.clone(),
        })
    }

    /// Identities currently locked under `kind`, sorted.
    pub fn locked(&self, kind: EventKind) -> Vec<RecordId> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().kind == kind)
            .map(|e| e.key().id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of active locks across all kinds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// For each identity: release a held lock, or arm a new one that expires
    /// after the configured timeout.
    pub fn toggle(&self, ids: impl IntoIterator<Item = RecordId>, kind: EventKind) {
        for id in ids {
            let key = LockKey { kind, id };
            match self.entries.entry(key.clone()) {
                Entry::Occupied(entry) => {
                    let (_, lock) = entry.remove_entry();
                    lock.expiry.cancel();
                    self.notify(LockUpdate::Released {
                        kind,
                        id: key.id,
                        reason: ReleaseReason::Toggled,
                    });
                }
                Entry::Vacant(entry) => {
                    entry.insert(self.new_entry(&key));
                    trace!(kind = %kind, id = %key.id, "event lock armed");
                    self.notify(LockUpdate::Armed { kind, id: key.id });
                }
            }
        }
    }

    /// Hold a lock for each identity, restarting the expiry of any lock that
    /// is already held.
    pub fn arm(&self, ids: impl IntoIterator<Item = RecordId>, kind: EventKind) {
        for id in ids {
            let key = LockKey { kind, id };
            let entry = self.new_entry(&key);
            if let Some(previous) = self.entries.insert(key.clone(), entry) {
                previous.expiry.cancel();
            }
            trace!(kind = %kind, id = %key.id, "event lock armed");
            self.notify(LockUpdate::Armed { kind, id: key.id });
        }
    }

    /// Remove any locks for the given identities. Idempotent.
    pub fn clear(&self, ids: impl IntoIterator<Item = RecordId>, kind: EventKind) {
        for id in ids {
            self.release(LockKey { kind, id }, ReleaseReason::Cleared);
        }
    }

    /// Consume the lock for `(kind, id)`, reporting whether one was held.
    pub fn take(&self, kind: EventKind, id: &RecordId) -> bool {
        self.release(
            LockKey {
                kind,
                id: id.clone(),
            },
            ReleaseReason::Consumed,
        )
    }

    /// Drop every lock and cancel every pending expiry.
    pub fn clear_all(&self) {
        let keys: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.release(key, ReleaseReason::Cleared);
        }
    }

    fn release(&self, key: LockKey, reason: ReleaseReason) -> bool {
        match self.entries.remove(&key) {
            Some((key, lock)) => {
                lock.expiry.cancel();
                trace!(kind = %key.kind, id = %key.id, ?reason, "event lock released");
                self.notify(LockUpdate::Released {
                    kind: key.kind,
                    id: key.id,
                    reason,
                });
                true
            }
            None => false,
        }
    }

    fn new_entry(&self, key: &LockKey) -> LockEntry {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let expiry = self.schedule_expiry(key.clone(), generation);
        LockEntry { generation, expiry }
    }

    fn schedule_expiry(&self, key: LockKey, generation: u64) -> ScheduledTask {
        let entries = Arc::clone(&self.entries);
        let updates_tx = self.updates_tx.clone();
        ScheduledTask::schedule(self.timeout, move || {
            if let Some((key, _)) = entries.remove_if(&key, |_, lock| lock.generation == generation)
            {
                trace!(kind = %key.kind, id = %key.id, "event lock expired");
                let _ = updates_tx.send(LockUpdate::Released {
                    kind: key.kind,
                    id: key.id,
                    reason: ReleaseReason::Expired,
                });
            }
        })
    }

    fn notify(&self, update: LockUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for lock update");
        }
    }
}

impl Drop for EventLocks {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.value().expiry.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(250);

    fn id(n: i64) -> RecordId {
        RecordId::Int(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_twice_leaves_no_lock() {
        let locks = EventLocks::new(TIMEOUT);
        locks.toggle([id(1)], EventKind::Created);
        assert!(locks.is_locked(EventKind::Created, &id(1)));

        locks.toggle([id(1)], EventKind::Created);
        assert!(!locks.is_locked(EventKind::Created, &id(1)));
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_after_timeout() {
        let locks = EventLocks::new(TIMEOUT);
        locks.toggle([id(1)], EventKind::Patched);

        tokio::time::sleep(Duration::from_millis(249)).await;
        assert!(locks.is_locked(EventKind::Patched, &id(1)));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!locks.is_locked(EventKind::Patched, &id(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_is_not_cleared_by_stale_timer() {
        let locks = EventLocks::new(TIMEOUT);
        locks.toggle([id(1)], EventKind::Updated);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Toggle off, then re-arm 100ms into the first lock's lifetime.
        locks.toggle([id(1)], EventKind::Updated);
        locks.toggle([id(1)], EventKind::Updated);

        // The first lock would have expired at 250ms.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(locks.is_locked(EventKind::Updated, &id(1)));

        // The re-armed lock expires at 350ms.
        tokio::time::sleep(Duration::from_millis(51)).await;
        assert!(!locks.is_locked(EventKind::Updated, &id(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_keeps_held_lock_and_restarts_expiry() {
        let locks = EventLocks::new(TIMEOUT);
        locks.arm([id(1)], EventKind::Patched);
        tokio::time::sleep(Duration::from_millis(200)).await;

        locks.arm([id(1)], EventKind::Patched);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(locks.is_locked(EventKind::Patched, &id(1)));
        assert_eq!(locks.len(), 1);

        tokio::time::sleep(Duration::from_millis(151)).await;
        assert!(!locks.is_locked(EventKind::Patched, &id(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kinds_are_independent() {
        let locks = EventLocks::new(TIMEOUT);
        locks.toggle([id(1), id(2)], EventKind::Created);
        locks.toggle([id(1)], EventKind::Removed);

        assert_eq!(locks.locked(EventKind::Created), vec![id(1), id(2)]);
        assert_eq!(locks.locked(EventKind::Removed), vec![id(1)]);
        assert!(!locks.is_locked(EventKind::Patched, &id(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_is_idempotent() {
        let locks = EventLocks::new(TIMEOUT);
        locks.toggle([id(1)], EventKind::Created);
        locks.clear([id(1), id(2)], EventKind::Created);
        locks.clear([id(1)], EventKind::Created);
        assert!(locks.is_empty());

        // A cleared lock's timer must not disturb a later arming.
        locks.toggle([id(1)], EventKind::Created);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(locks.is_locked(EventKind::Created, &id(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_consumes_lock() {
        let locks = EventLocks::new(TIMEOUT);
        locks.toggle([id(5)], EventKind::Removed);
        assert!(locks.take(EventKind::Removed, &id(5)));
        assert!(!locks.take(EventKind::Removed, &id(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications() {
        let locks = EventLocks::new(TIMEOUT);
        let mut rx = locks.subscribe();

        locks.toggle([id(1)], EventKind::Created);
        locks.clear([id(1)], EventKind::Created);
        locks.toggle([id(2)], EventKind::Created);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            rx.try_recv().unwrap(),
            LockUpdate::Armed {
                kind: EventKind::Created,
                id: id(1)
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            LockUpdate::Released {
                kind: EventKind::Created,
                id: id(1),
                reason: ReleaseReason::Cleared
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), LockUpdate::Armed { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            LockUpdate::Released {
                kind: EventKind::Created,
                id: id(2),
                reason: ReleaseReason::Expired
            }
        );
    }
}
