// File: `crates/medsync-core/src/lib.rs`
//! Core types for the MedSync offline-first records client.
//!
//! - [`entity`] - identifiers, entity kinds and the [`Entity`] trait
//! - [`model`] - users, records, audit entries and share grants
//! - [`envelope`] - the stored form shared by the cache and the remote store
//! - [`lww`] - the last-writer-wins merge rule

pub mod entity;
pub mod envelope;
pub mod lww;
pub mod model;

pub use entity::{BlobId, Entity, EntityError, EntityId, EntityKind, NaturalKey, Timestamp};
pub use envelope::Envelope;
pub use lww::{Resolution, Versioned};
pub use model::{
    AuditAction, AuditEntry, Record, SharePermission, ShareGrant, User, UserRole,
};
