//! Domain entities: users, medical records, audit entries and share grants.

use crate::entity::{BlobId, Entity, EntityId, EntityKind, NaturalKey, Timestamp};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Patient,
    Doctor,
    Admin,
}

/// An account known to this client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: EntityId,
    pub email: String,
    pub display_name: String,
    pub role: UserRole,
    pub updated_at: Timestamp,
}

impl Entity for User {
    const KIND: EntityKind = EntityKind::User;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn touch(&mut self, at: Timestamp) {
        self.updated_at = at;
    }
}

/// A medical record owned by a user.
///
/// `file_id` is a weak reference into the blob store; the record does not
/// own the blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: EntityId,
    pub user_id: EntityId,
    pub title: String,
    pub record_type: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub file_id: Option<BlobId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Record {
    pub const NATURAL_KEY_FIELDS: [&'static str; 4] = ["user_id", "title", "record_type", "date"];
}

impl Entity for Record {
    const KIND: EntityKind = EntityKind::Record;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn touch(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn natural_key(&self) -> Option<NaturalKey> {
        Some(
            NaturalKey::new()
                .with("user_id", self.user_id.as_str())
                .with("title", self.title.as_str())
                .with("record_type", self.record_type.as_str())
                .with("date", self.date.to_string()),
        )
    }

    fn attachment(&self) -> Option<&BlobId> {
        self.file_id.as_ref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    Logout,
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    RecordShared,
    ShareRevoked,
    FileAttached,
    DuplicateSkipped,
}

/// Append-only audit trail entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: EntityId,
    pub user_id: EntityId,
    pub action: AuditAction,
    #[serde(default)]
    pub target: Option<EntityId>,
    #[serde(default)]
    pub detail: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Entity for AuditEntry {
    const KIND: EntityKind = EntityKind::AuditEntry;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn touch(&mut self, at: Timestamp) {
        self.updated_at = at;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharePermission {
    Read,
    ReadWrite,
}

/// Grants another person access to one record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareGrant {
    pub id: EntityId,
    pub record_id: EntityId,
    pub owner_id: EntityId,
    pub grantee_email: String,
    pub permission: SharePermission,
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl ShareGrant {
    pub fn is_active(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }
}

impl Entity for ShareGrant {
    const KIND: EntityKind = EntityKind::ShareGrant;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn touch(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn natural_key(&self) -> Option<NaturalKey> {
        Some(
            NaturalKey::new()
                .with("record_id", self.record_id.as_str())
                .with("grantee_email", self.grantee_email.as_str()),
        )
    }
}

/// Fields a tombstone of `kind` keeps so owner-scoped queries still see it.
pub fn owner_fields(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::User => &[],
        EntityKind::Record | EntityKind::AuditEntry => &["user_id"],
        EntityKind::ShareGrant => &["owner_id", "record_id"],
    }
}

/// Natural key of a serialized body of the given kind.
pub fn natural_key_of(kind: EntityKind, body: &Value) -> Option<NaturalKey> {
    match kind {
        EntityKind::Record => serde_json::from_value::<Record>(body.clone())
            .ok()
            .and_then(|r| r.natural_key()),
        EntityKind::ShareGrant => serde_json::from_value::<ShareGrant>(body.clone())
            .ok()
            .and_then(|s| s.natural_key()),
        EntityKind::User | EntityKind::AuditEntry => None,
    }
}

/// Blob referenced by a serialized body of the given kind.
pub fn attachment_of(kind: EntityKind, body: &Value) -> Option<BlobId> {
    match kind {
        EntityKind::Record => body
            .get("file_id")
            .and_then(Value::as_str)
            .map(|s| BlobId(s.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(title: &str) -> Record {
        Record {
            id: EntityId::generate(),
            user_id: EntityId::from("u1"),
            title: title.to_string(),
            record_type: "lab_result".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            notes: "fasting".to_string(),
            file_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_natural_key_ignores_id_and_notes() {
        let a = record("Blood panel");
        let mut b = record("Blood panel");
        b.notes = "different".to_string();

        assert_ne!(a.id, b.id);
        assert_eq!(a.natural_key(), b.natural_key());
        assert_ne!(a.natural_key(), record("X-ray").natural_key());
    }

    #[test]
    fn test_natural_key_matches_serialized_record() {
        let r = record("Blood panel");
        let body = serde_json::to_value(&r).unwrap();

        let key = natural_key_of(EntityKind::Record, &body).unwrap();
        assert!(key.matches(&body));
        assert_eq!(key.fields.len(), Record::NATURAL_KEY_FIELDS.len());
        assert!(natural_key_of(EntityKind::User, &body).is_none());
    }

    #[test]
    fn test_share_expiry() {
        let now = Utc::now();
        let grant = ShareGrant {
            id: EntityId::generate(),
            record_id: EntityId::from("r1"),
            owner_id: EntityId::from("u1"),
            grantee_email: "dr@example.org".to_string(),
            permission: SharePermission::Read,
            expires_at: Some(now - chrono::Duration::hours(1)),
            updated_at: now,
        };

        assert!(!grant.is_active(now));
        assert!(ShareGrant {
            expires_at: None,
            ..grant
        }
        .is_active(now));
    }
}
