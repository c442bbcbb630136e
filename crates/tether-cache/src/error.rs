//! Error types for the record cache.

use thiserror::Error;

use crate::RecordId;

/// Errors that can occur when mutating the record cache.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Patch or update targeted an identity that is not cached.
    #[error("record not found: {id}")]
    NotFound { id: RecordId },

    /// The record does not carry a usable identity value.
    #[error("record is missing identity field `{field}`")]
    MissingIdentity { field: String },

    /// The value is not a record (a JSON object).
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A patch or update tried to change a record's identity.
    #[error("identity mismatch: record {id} cannot become {attempted}")]
    IdentityMismatch { id: RecordId, attempted: RecordId },

    /// Invalid cache configuration.
    #[error("invalid cache configuration: {0}")]
    Config(String),
}
