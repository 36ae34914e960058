//! Error types for the MedSync SDK.

use medsync_cache::CacheError;
use medsync_core::{EntityError, EntityId, EntityKind};
use std::time::Duration;
use thiserror::Error;

/// Error reported by the remote store boundary: a status code plus message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("unavailable", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not-found", message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new("unauthenticated", message)
    }
}

/// Error type for SDK operations.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// DNS, refused connection, handshake or transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credential or session failure.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Missing document; never retried.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Local storage full after eviction.
    #[error("Local storage quota exceeded: {0}")]
    Quota(String),

    /// Natural-key collision with an existing remote entity.
    #[error("Duplicate {kind}: matches existing {existing}")]
    Duplicate { kind: EntityKind, existing: EntityId },

    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Rejected before any local or remote write.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The coordinator reports offline; nothing was sent.
    #[error("Remote store is offline")]
    Offline,

    /// Remote failure not matching any known class.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Cache error: {0}")]
    Cache(CacheError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Code fragments and message patterns of network-level failures.
const TRANSPORT_PATTERNS: &[&str] = &[
    "unavailable",
    "deadline-exceeded",
    "network",
    "transport",
    "failed to fetch",
    "webchannel",
    "connection refused",
    "err_connection_refused",
    "econnrefused",
    "err_name_not_resolved",
    "enotfound",
    "dns",
    "ssl",
    "tls",
    "handshake",
    "certificate",
    "too many requests",
    "resource-exhausted",
    "429",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthenticated",
    "permission-denied",
    "auth/",
    "token expired",
    "invalid credential",
];

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        let haystack = format!("{} {}", err.code, err.message).to_lowercase();
        if err.code == "not-found" {
            SyncError::NotFound(err.message)
        } else if matches_any(&haystack, AUTH_PATTERNS) {
            SyncError::Auth(err.to_string())
        } else if matches_any(&haystack, TRANSPORT_PATTERNS) {
            SyncError::Transport(err.to_string())
        } else {
            SyncError::Remote(err)
        }
    }
}

impl From<CacheError> for SyncError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Quota { .. } => SyncError::Quota(err.to_string()),
            CacheError::NotFound { kind, id } => SyncError::NotFound(format!("{}/{}", kind, id)),
            other => SyncError::Cache(other),
        }
    }
}

impl From<EntityError> for SyncError {
    fn from(err: EntityError) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Failure classes the resolution escalator can act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Transport,
    Auth,
}

impl SyncError {
    /// Classify an error as network/auth related, if it is.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            SyncError::Transport(_) | SyncError::Timeout(_) => Some(FailureClass::Transport),
            SyncError::Auth(_) => Some(FailureClass::Auth),
            SyncError::Remote(err) => {
                let haystack = format!("{} {}", err.code, err.message).to_lowercase();
                if matches_any(&haystack, AUTH_PATTERNS) {
                    Some(FailureClass::Auth)
                } else if matches_any(&haystack, TRANSPORT_PATTERNS) {
                    Some(FailureClass::Transport)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_class().is_some() || matches!(self, SyncError::Offline)
    }
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SyncError>;
