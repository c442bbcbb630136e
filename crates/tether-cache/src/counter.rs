//! Floor-protected counter for outstanding asynchronous work.

use tokio::sync::watch;
use tracing::trace;

/// Counts overlapping in-flight operations of one kind.
///
/// "Anything in flight" is simply `count() > 0`. Increments and decrements
/// commute, and decrement never takes the count below zero.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    count_tx: watch::Sender<usize>,
}

impl Counter {
    /// Create a counter starting at zero.
    pub fn new(name: &'static str) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self { name, count_tx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current count.
    pub fn count(&self) -> usize {
        *self.count_tx.borrow()
    }

    /// Whether any tracked operation is in flight.
    pub fn is_active(&self) -> bool {
        self.count() > 0
    }

    pub fn increment(&self) {
        self.count_tx.send_modify(|count| *count += 1);
        trace!(counter = self.name, count = self.count(), "counter incremented");
    }

    /// Decrease by one. A no-op at zero.
    pub fn decrement(&self) {
        let changed = self.count_tx.send_if_modified(|count| {
            if *count == 0 {
                return false;
            }
            *count -= 1;
            true
        });
        if changed {
            trace!(counter = self.name, count = self.count(), "counter decremented");
        }
    }

    /// Observe the count. The receiver sees the current value immediately.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    /// Increment now and decrement when the guard drops.
    pub fn track(&self) -> CounterGuard<'_> {
        self.increment();
        CounterGuard { counter: self }
    }
}

/// Decrements its [`Counter`] on drop.
#[must_use = "the counter is decremented as soon as the guard is dropped"]
pub struct CounterGuard<'a> {
    counter: &'a Counter,
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}
