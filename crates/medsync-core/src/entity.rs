//! Entity identity and the trait every synchronized entity implements.
//!
//! Every entity carries a client-assigned [`EntityId`] that never changes
//! across local and remote copies, plus an `updated_at` timestamp used by
//! the last-writer-wins rule in [`crate::lww`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use ulid::Ulid;

/// Wall-clock timestamp used for `updated_at` and friends.
pub type Timestamp = DateTime<Utc>;

/// Errors raised while converting entities to and from their stored form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error("Missing field `{field}` in {kind} document")]
    MissingField { kind: EntityKind, field: &'static str },

    #[error("Entity kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        expected: EntityKind,
        found: EntityKind,
    },

    #[error("Entity {kind}/{id} is deleted")]
    Deleted { kind: EntityKind, id: EntityId },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EntityError {
    fn from(err: serde_json::Error) -> Self {
        EntityError::Serialization(err.to_string())
    }
}

/// Stable, globally unique (per kind) identifier assigned at creation.
///
/// Freshly generated ids are ULIDs, so the creation time is recoverable
/// from the id itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creation time embedded in the id, in unix milliseconds.
    ///
    /// Returns `None` for ids that are not ULIDs (e.g. imported data).
    pub fn created_at_ms(&self) -> Option<u64> {
        Ulid::from_string(&self.0).ok().map(|u| u.timestamp_ms())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a binary payload held in the separate blob store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(pub String);

impl BlobId {
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn created_at_ms(&self) -> Option<u64> {
        Ulid::from_string(&self.0).ok().map(|u| u.timestamp_ms())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The entity types the client keeps in its cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Record,
    AuditEntry,
    ShareGrant,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::User,
        EntityKind::Record,
        EntityKind::AuditEntry,
        EntityKind::ShareGrant,
    ];

    /// Short name used in cache keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Record => "record",
            EntityKind::AuditEntry => "audit",
            EntityKind::ShareGrant => "share",
        }
    }

    /// Remote collection holding this kind.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Record => "records",
            EntityKind::AuditEntry => "audit_log",
            EntityKind::ShareGrant => "shares",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        EntityKind::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field/value pairs that identify an entity independently of its id.
///
/// Two entities with equal natural keys describe the same real-world item.
#[derive(Clone, Debug, PartialEq)]
pub struct NaturalKey {
    pub fields: Vec<(&'static str, serde_json::Value)>,
}

impl NaturalKey {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn with(mut self, field: &'static str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.push((field, value.into()));
        self
    }

    /// Whether the given serialized body carries exactly these field values.
    pub fn matches(&self, body: &serde_json::Value) -> bool {
        self.fields
            .iter()
            .all(|(field, value)| body.get(*field) == Some(value))
    }
}

impl Default for NaturalKey {
    fn default() -> Self {
        Self::new()
    }
}

/// A synchronized entity.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &EntityId;

    fn updated_at(&self) -> Timestamp;

    fn touch(&mut self, at: Timestamp);

    /// Natural key used for duplicate detection before a remote push.
    fn natural_key(&self) -> Option<NaturalKey> {
        None
    }

    /// Binary payload this entity references, if any.
    fn attachment(&self) -> Option<&BlobId> {
        None
    }
}
