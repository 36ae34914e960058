//! Type-erased stored form of an entity.
//!
//! The cache and the remote store both hold [`Envelope`]s. A deleted entity
//! is kept as a tombstone envelope (no body, `deleted = true`) so that the
//! delete takes part in last-writer-wins like any other write.

use crate::entity::{BlobId, Entity, EntityError, EntityId, EntityKind, NaturalKey, Timestamp};
use crate::lww::Versioned;
use crate::model;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const UPDATED_AT: &str = "updated_at";
const DELETED: &str = "deleted";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EntityKind,
    pub id: EntityId,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<BlobId>,
    #[serde(default)]
    pub body: Value,
}

impl Envelope {
    pub fn from_entity<E: Entity>(entity: &E) -> Result<Self, EntityError> {
        Ok(Self {
            kind: E::KIND,
            id: entity.id().clone(),
            updated_at: entity.updated_at(),
            deleted: false,
            attachment: entity.attachment().cloned(),
            body: serde_json::to_value(entity)?,
        })
    }

    pub fn tombstone(kind: EntityKind, id: EntityId, at: Timestamp) -> Self {
        Self {
            kind,
            id,
            updated_at: at,
            deleted: true,
            attachment: None,
            body: Value::Null,
        }
    }

    /// Tombstone replacing this envelope, keeping only the fields that place
    /// it in its owner's queries.
    pub fn deleted_at(&self, at: Timestamp) -> Self {
        let mut body = serde_json::Map::new();
        if let Value::Object(map) = &self.body {
            for field in model::owner_fields(self.kind) {
                if let Some(value) = map.get(*field) {
                    body.insert(field.to_string(), value.clone());
                }
            }
        }
        Self {
            body: if body.is_empty() { Value::Null } else { Value::Object(body) },
            ..Self::tombstone(self.kind, self.id.clone(), at)
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// Decode the body back into a typed entity.
    pub fn decode<E: Entity>(&self) -> Result<E, EntityError> {
        if self.kind != E::KIND {
            return Err(EntityError::KindMismatch {
                expected: E::KIND,
                found: self.kind,
            });
        }
        if self.deleted {
            return Err(EntityError::Deleted {
                kind: self.kind,
                id: self.id.clone(),
            });
        }
        Ok(serde_json::from_value(self.body.clone())?)
    }

    pub fn natural_key(&self) -> Option<NaturalKey> {
        if self.deleted {
            return None;
        }
        model::natural_key_of(self.kind, &self.body)
    }

    /// Document data written to the remote store.
    pub fn to_document(&self) -> Value {
        if self.deleted {
            let mut data = match &self.body {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            data.insert("id".to_string(), Value::String(self.id.to_string()));
            data.insert(UPDATED_AT.to_string(), serde_json::json!(self.updated_at));
            data.insert(DELETED.to_string(), Value::Bool(true));
            return Value::Object(data);
        }
        let mut data = self.body.clone();
        if let Value::Object(map) = &mut data {
            map.insert(DELETED.to_string(), Value::Bool(false));
        }
        data
    }

    /// Rebuild an envelope from remote document data.
    pub fn from_document(kind: EntityKind, id: &str, data: &Value) -> Result<Self, EntityError> {
        let updated_at = data
            .get(UPDATED_AT)
            .cloned()
            .ok_or(EntityError::MissingField {
                kind,
                field: UPDATED_AT,
            })?;
        let updated_at: Timestamp = serde_json::from_value(updated_at)?;
        let deleted = data.get(DELETED).and_then(Value::as_bool).unwrap_or(false);
        let id = EntityId::from_string(id);

        let mut body = data.clone();
        if let Value::Object(map) = &mut body {
            map.remove(DELETED);
        }

        if deleted {
            return Ok(Self {
                body,
                ..Self::tombstone(kind, id, updated_at)
            });
        }

        Ok(Self {
            kind,
            attachment: model::attachment_of(kind, &body),
            id,
            updated_at,
            deleted: false,
            body,
        })
    }
}

impl Versioned for Envelope {
    fn version(&self) -> Timestamp {
        self.updated_at
    }
}
