//! Reactive record cache with realtime event reconciliation.
//!
//! This crate keeps an in-memory mirror of server-side records consistent
//! under local optimistic mutations and asynchronous realtime push events.
//!
//! ## Features
//!
//! - **Cache**: ordered, identity-indexed record collection with CRUD entry points
//! - **Event locks**: per-record suppression of realtime echoes, with automatic expiry
//! - **Pending registry**: shared futures that resolve once a write kind has settled
//! - **Counter**: floor-protected count of in-flight queries
//!
//! ## The echo protocol
//!
//! A local mutation arms an event lock before it is dispatched. When the
//! server's realtime echo arrives, [`RecordCache::apply_event`] finds the
//! lock, consumes it and skips the event. Unlocked events are authoritative.

pub mod cache;
pub mod config;
pub mod counter;
mod error;
pub mod events;
pub mod locks;
pub mod pending;
pub mod query;
mod record;
pub mod timer;

pub use cache::{CacheUpdate, PendingGuard, RecordCache};
pub use config::{CacheConfig, CacheConfigBuilder};
pub use counter::{Counter, CounterGuard};
pub use error::CacheError;
pub use events::{EventKind, EventOutcome, OperationKind, RealtimeEvent};
pub use locks::{EventLocks, LockUpdate, ReleaseReason};
pub use pending::{PendingRegistry, PendingSource, Settled};
pub use query::{All, FieldEquals, LocalQuery, Page};
pub use record::{Record, RecordId, identity_of};
pub use timer::ScheduledTask;
