//! Error types for the cache layer.

use medsync_core::{EntityError, EntityId, EntityKind};
use thiserror::Error;

/// Errors raised by a [`crate::storage::KeyValueStorage`] backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Corrupt storage contents: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Errors that can occur in cache operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Not found: {kind}/{id}")]
    NotFound { kind: EntityKind, id: EntityId },

    #[error("Local storage is full ({evicted} attachments evicted, {retained} retained)")]
    Quota { evicted: usize, retained: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error(transparent)]
    Entity(#[from] EntityError),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::QuotaExceeded { .. } => CacheError::Quota {
                evicted: 0,
                retained: 0,
            },
            other => CacheError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
