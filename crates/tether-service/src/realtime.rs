//! Realtime event listener.
//!
//! Feeds server push events into a cache, optionally debounced so bursts
//! are applied together once the stream goes quiet. Echoes of local writes
//! are recognized as they arrive, while their locks are still held, and
//! never reach the buffer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use tether_cache::{EventOutcome, RealtimeEvent, RecordCache};

use crate::config::ServiceConfig;

/// Counts reported when a listener stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Applies realtime events from a channel to a cache.
pub struct RealtimeListener {
    cache: Arc<RecordCache>,
    debounce: Option<Duration>,
    max_batch: usize,
}

impl RealtimeListener {
    pub fn new(cache: Arc<RecordCache>, config: &ServiceConfig) -> Self {
        Self {
            cache,
            debounce: config.debounce(),
            max_batch: config.max_batch.max(1),
        }
    }

    /// Run the listener on its own task.
    pub fn spawn(
        self,
        events: mpsc::Receiver<RealtimeEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<ListenerStats> {
        tokio::spawn(async move { self.run(events, shutdown_rx).await })
    }

    /// Process events until the channel closes or shutdown is signalled.
    ///
    /// Buffered events are flushed before returning. Dropping the shutdown
    /// sender counts as a shutdown signal.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<RealtimeEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> ListenerStats {
        let mut stats = ListenerStats::default();
        let mut buffer = Vec::new();
        let mut flush_at: Option<Instant> = None;

        info!(debounce = ?self.debounce, "realtime listener started");

        loop {
            let quiet_period = async move {
                match flush_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("realtime listener received shutdown signal");
                        break;
                    }
                }

                _ = quiet_period => {
                    self.flush(&mut buffer, &mut stats);
                    flush_at = None;
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("realtime channel closed");
                        break;
                    };
                    match self.debounce {
                        None => self.apply(event, &mut stats),
                        Some(quiet) => {
                            if self.admit(&event, &mut stats) {
                                buffer.push(event);
                                if buffer.len() >= self.max_batch {
                                    self.flush(&mut buffer, &mut stats);
                                    flush_at = None;
                                } else {
                                    flush_at = Some(Instant::now() + quiet);
                                }
                            }
                        }
                    }
                }
            }
        }

        self.flush(&mut buffer, &mut stats);
        info!(
            applied = stats.applied,
            skipped = stats.skipped,
            failed = stats.failed,
            "realtime listener stopped"
        );
        stats
    }

    fn flush(&self, buffer: &mut Vec<RealtimeEvent>, stats: &mut ListenerStats) {
        if buffer.is_empty() {
            return;
        }
        debug!(count = buffer.len(), "flushing buffered realtime events");
        for event in buffer.drain(..) {
            let kind = event.kind;
            match self.cache.apply_authoritative(event) {
                Ok(()) => stats.applied += 1,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "failed to apply realtime event");
                    stats.failed += 1;
                }
            }
        }
    }

    /// Whether `event` should be buffered. Echoes and malformed events are
    /// counted and dropped.
    fn admit(&self, event: &RealtimeEvent, stats: &mut ListenerStats) -> bool {
        match self.cache.consume_echo(event) {
            Ok(false) => true,
            Ok(true) => {
                trace!(kind = %event.kind, "echo skipped");
                stats.skipped += 1;
                false
            }
            Err(e) => {
                warn!(kind = %event.kind, error = %e, "failed to apply realtime event");
                stats.failed += 1;
                false
            }
        }
    }

    fn apply(&self, event: RealtimeEvent, stats: &mut ListenerStats) {
        let kind = event.kind;
        match self.cache.apply_event(event) {
            Ok(EventOutcome::Applied) => stats.applied += 1,
            Ok(EventOutcome::Skipped) => {
                trace!(kind = %kind, "echo skipped");
                stats.skipped += 1;
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "failed to apply realtime event");
                stats.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tether_cache::{EventKind, RecordId};

    fn listener(config: &ServiceConfig) -> (Arc<RecordCache>, RealtimeListener) {
        let cache = RecordCache::new(config.cache.clone()).unwrap();
        (Arc::clone(&cache), RealtimeListener::new(cache, config))
    }

    fn created(id: i64) -> RealtimeEvent {
        RealtimeEvent::new(EventKind::Created, json!({ "id": id }))
    }

    #[tokio::test]
    async fn test_applies_until_channel_closes() {
        let (cache, listener) = listener(&ServiceConfig::default());
        let (events_tx, events_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        events_tx.send(created(1)).await.unwrap();
        events_tx.send(created(2)).await.unwrap();
        events_tx
            .send(RealtimeEvent::new(EventKind::Patched, json!("no record")))
            .await
            .unwrap();
        drop(events_tx);

        let stats = listener.run(events_rx, shutdown_rx).await;
        assert_eq!(
            stats,
            ListenerStats {
                applied: 2,
                skipped: 0,
                failed: 1
            }
        );
        assert_eq!(cache.ids(), vec![RecordId::Int(1), RecordId::Int(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_waits_for_quiet_period() {
        let config = ServiceConfig::builder().debounce_ms(50).build().unwrap();
        let (cache, listener) = listener(&config);
        let (events_tx, events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = listener.spawn(events_rx, shutdown_rx);

        events_tx.send(created(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        events_tx.send(created(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.ids(), vec![RecordId::Int(1), RecordId::Int(2)]);

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().applied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_immediately() {
        let config = ServiceConfig::builder()
            .debounce_ms(1_000)
            .max_batch(2)
            .build()
            .unwrap();
        let (cache, listener) = listener(&config);
        let (events_tx, events_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = listener.spawn(events_rx, shutdown_rx);

        events_tx.send(created(1)).await.unwrap();
        events_tx.send(created(2)).await.unwrap();
        events_tx.send(created(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.ids(), vec![RecordId::Int(1), RecordId::Int(2)]);

        drop(events_tx);
        handle.await.unwrap();
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_buffer() {
        let config = ServiceConfig::builder().debounce_ms(1_000).build().unwrap();
        let (cache, listener) = listener(&config);
        let (events_tx, events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = listener.spawn(events_rx, shutdown_rx);

        events_tx.send(created(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.is_empty());

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(cache.ids(), vec![RecordId::Int(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_suppressed_under_steady_debounced_traffic() {
        let config = ServiceConfig::builder().debounce_ms(50).build().unwrap();
        let (cache, listener) = listener(&config);
        let (events_tx, events_rx) = mpsc::channel(32);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = listener.spawn(events_rx, shutdown_rx);

        cache.toggle_lock([RecordId::Int(1)], EventKind::Patched);
        events_tx
            .send(RealtimeEvent::new(EventKind::Patched, json!({"id": 1, "v": 1})))
            .await
            .unwrap();

        // Events spaced under the quiet period keep the buffer open well past
        // the lock timeout.
        for n in 0..10 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            events_tx.send(created(100 + n)).await.unwrap();
        }
        assert!(cache.is_empty());
        drop(events_tx);

        let stats = handle.await.unwrap();
        assert_eq!(
            stats,
            ListenerStats {
                applied: 10,
                skipped: 1,
                failed: 0
            }
        );
        assert!(!cache.contains(&RecordId::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_event_leaves_later_lock_alone() {
        let config = ServiceConfig::builder().debounce_ms(50).build().unwrap();
        let (cache, listener) = listener(&config);
        let (events_tx, events_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = listener.spawn(events_rx, shutdown_rx);

        events_tx.send(created(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A local create of the same record arms its lock while the foreign
        // event is still buffered.
        cache.toggle_lock([RecordId::Int(5)], EventKind::Created);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.ids(), vec![RecordId::Int(5)]);
        assert!(cache.is_locked(EventKind::Created, &RecordId::Int(5)));

        drop(events_tx);
        assert_eq!(handle.await.unwrap().applied, 1);
    }
}
