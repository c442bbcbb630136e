//! Cancellable delayed tasks on the Tokio runtime.

use std::time::Duration;

use tokio::task::AbortHandle;

/// A callback scheduled to run once after a delay.
///
/// Dropping the handle does not cancel the task; call [`cancel`](Self::cancel).
#[derive(Debug)]
pub struct ScheduledTask {
    handle: AbortHandle,
}

impl ScheduledTask {
    /// Run `f` after `delay`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Self {
            handle: handle.abort_handle(),
        }
    }

    /// Cancel the task. A no-op if it already ran.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
