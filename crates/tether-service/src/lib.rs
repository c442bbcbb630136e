//! Remote service glue for tether record caches.
//!
//! This crate connects a [`RecordCache`](tether_cache::RecordCache) to the
//! outside world:
//!
//! - **Service**: optimistic create/update/patch/remove against a [`ServiceClient`],
//!   with echo locks and rollback on failure
//! - **Realtime**: a listener that applies pushed events, optionally debounced
//! - **Storage**: snapshot hydration and persistence

pub mod client;
pub mod config;
mod error;
pub mod realtime;
pub mod service;
pub mod storage;

pub use client::{FindResult, ServiceClient};
pub use config::{ServiceConfig, ServiceConfigBuilder, TEMP_ID_FIELD};
pub use error::{ClientError, ServiceError};
pub use realtime::{ListenerStats, RealtimeListener};
pub use service::Service;
pub use storage::{MemoryStorage, Storage, hydrate, persist, sync_to_storage, watch_storage};
