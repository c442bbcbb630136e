//! Remote API abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_cache::RecordId;

use crate::ClientError;

/// A page of records returned by a remote find.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FindResult {
    pub total: usize,
    pub limit: Option<usize>,
    pub skip: usize,
    pub data: Vec<Value>,
}

/// Remote service holding the authoritative records.
///
/// Every method resolves to the server's copy of the affected record.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Query records with backend-specific parameters.
    async fn find(&self, params: &Value) -> Result<FindResult, ClientError>;

    /// Fetch a single record.
    async fn get(&self, id: &RecordId) -> Result<Value, ClientError>;

    /// Create a record.
    async fn create(&self, data: Value) -> Result<Value, ClientError>;

    /// Replace a record.
    async fn update(&self, id: &RecordId, data: Value) -> Result<Value, ClientError>;

    /// Merge fields into a record.
    async fn patch(&self, id: &RecordId, changes: Value) -> Result<Value, ClientError>;

    /// Delete a record.
    async fn remove(&self, id: &RecordId) -> Result<Value, ClientError>;
}
