//! Shared "write operation settled" futures, one per operation kind.
//!
//! [`PendingRegistry::await_settled`] hands every concurrent caller the same
//! future while it is unresolved, and creates a fresh one only after the
//! previous future resolved.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::events::OperationKind;

/// Future resolving to `true` once an operation kind has settled.
///
/// Clones share one underlying wait; compare with [`Shared::ptr_eq`].
pub type Settled = Shared<BoxFuture<'static, bool>>;

/// Something exposing one boolean pending indicator per operation kind.
pub trait PendingSource {
    /// Watch the indicator for `kind`.
    fn watch_pending(&self, kind: OperationKind) -> watch::Receiver<bool>;
}

struct PendingState {
    settled: Settled,
    resolved: Arc<AtomicBool>,
    watcher: AbortHandle,
    indicator: &'static str,
}

/// Tracks one settle-future per operation kind.
///
/// State is created lazily and lives until [`reset`](Self::reset).
#[derive(Default)]
pub struct PendingRegistry {
    states: Mutex<HashMap<OperationKind, PendingState>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the settle-future for `kind`, creating one if none exists or the
    /// previous one already resolved.
    ///
    /// The watcher observes the indicator's current value immediately and
    /// then every change. On the first `false` it yields once, so same-tick
    /// follow-up mutations can land, then resolves with `true`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn await_settled(&self, source: &dyn PendingSource, kind: OperationKind) -> Settled {
        let mut states = self.states.lock().unwrap();

        if let Some(state) = states.get(&kind) {
            if !state.resolved.load(Ordering::SeqCst) {
                trace!(indicator = state.indicator, "reusing in-flight settle future");
                return state.settled.clone();
            }
        }

        let state = Self::watch(source.watch_pending(kind), kind);
        let settled = state.settled.clone();
        debug!(indicator = state.indicator, "created settle future");
        states.insert(kind, state);
        settled
    }

    /// Whether state is tracked for `kind`.
    pub fn is_tracked(&self, kind: OperationKind) -> bool {
        self.states.lock().unwrap().contains_key(&kind)
    }

    /// Whether the tracked future for `kind` has resolved.
    ///
    /// `None` when nothing is tracked.
    pub fn is_resolved(&self, kind: OperationKind) -> Option<bool> {
        self.states
            .lock()
            .unwrap()
            .get(&kind)
            .map(|state| state.resolved.load(Ordering::SeqCst))
    }

    /// Drop all tracked state.
    ///
    /// Unresolved futures are abandoned and never resolve.
    pub fn reset(&self) {
        let mut states = self.states.lock().unwrap();
        for (_, state) in states.drain() {
            state.watcher.abort();
        }
        debug!("pending registry reset");
    }

    fn watch(mut pending_rx: watch::Receiver<bool>, kind: OperationKind) -> PendingState {
        let indicator = kind.indicator_name();
        let resolved = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();

        let flag = Arc::clone(&resolved);
        let watcher = tokio::spawn(async move {
            loop {
                if !*pending_rx.borrow_and_update() {
                    break;
                }
                if pending_rx.changed().await.is_err() {
                    // Indicator owner is gone; the future stays unresolved.
                    return;
                }
            }
            tokio::task::yield_now().await;
            flag.store(true, Ordering::SeqCst);
            trace!(indicator, "operation settled");
            let _ = done_tx.send(true);
        });

        let settled = async move {
            match done_rx.await {
                Ok(settled) => settled,
                Err(_) => std::future::pending().await,
            }
        }
        .boxed()
        .shared();

        PendingState {
            settled,
            resolved,
            watcher: watcher.abort_handle(),
            indicator,
        }
    }
}

impl Drop for PendingRegistry {
    fn drop(&mut self) {
        if let Ok(mut states) = self.states.lock() {
            for (_, state) in states.drain() {
                state.watcher.abort();
            }
        }
    }
}
