//! Error types for service operations.

use thiserror::Error;

use tether_cache::CacheError;

/// Errors reported by a [`ServiceClient`](crate::ServiceClient).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The server has no such record.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server rejected the request.
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The request did not complete.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors that can occur in service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Cache error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// API client error.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server response did not carry what was expected.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid service configuration.
    #[error("invalid service configuration: {0}")]
    Config(String),
}
