//! Persisted log of local writes the remote store has not confirmed yet.
//!
//! An entry stays until a remote copy with an equal-or-later `updated_at`
//! is written or observed. A failed push only bumps `attempts`.

use crate::error::Result;
use crate::storage::KeyValueStorage;
use medsync_core::{Envelope, EntityId, EntityKind, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub kind: EntityKind,
    pub id: EntityId,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

type PendingMap = BTreeMap<String, PendingWrite>;

fn entry_key(kind: EntityKind, id: &EntityId) -> String {
    format!("{}:{}", kind.as_str(), id)
}

pub struct PendingWriteLog {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    lock: Mutex<()>,
}

impl PendingWriteLog {
    pub fn new(storage: Arc<dyn KeyValueStorage>, namespace: &str) -> Self {
        Self {
            storage,
            key: format!("{}:pending", namespace),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<PendingMap> {
        match self.storage.get_item(&self.key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(PendingMap::new()),
        }
    }

    fn save(&self, map: &PendingMap) -> Result<()> {
        if map.is_empty() {
            self.storage.remove_item(&self.key)?;
        } else {
            self.storage.set_item(&self.key, &serde_json::to_string(map)?)?;
        }
        Ok(())
    }

    /// Record (or refresh) a local write awaiting remote confirmation.
    pub fn record(&self, envelope: &Envelope) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.load()?;
        let key = entry_key(envelope.kind, &envelope.id);
        let attempts = match map.get(&key) {
            Some(existing) if existing.updated_at >= envelope.updated_at => existing.attempts,
            _ => 0,
        };
        map.insert(
            key,
            PendingWrite {
                kind: envelope.kind,
                id: envelope.id.clone(),
                updated_at: envelope.updated_at,
                deleted: envelope.deleted,
                attempts,
                last_error: None,
            },
        );
        self.save(&map)
    }

    /// Drop the entry if `remote_updated_at` covers the pending write.
    ///
    /// Returns `true` when an entry was removed.
    pub fn confirm(
        &self,
        kind: EntityKind,
        id: &EntityId,
        remote_updated_at: Timestamp,
    ) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut map = self.load()?;
        let key = entry_key(kind, id);
        match map.get(&key) {
            Some(entry) if remote_updated_at >= entry.updated_at => {
                map.remove(&key);
                self.save(&map)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Count a failed push attempt.
    pub fn note_failure(&self, kind: EntityKind, id: &EntityId, error: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.load()?;
        if let Some(entry) = map.get_mut(&entry_key(kind, id)) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            self.save(&map)?;
        }
        Ok(())
    }

    /// Remove an entry unconditionally.
    pub fn discard(&self, kind: EntityKind, id: &EntityId) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.load()?;
        if map.remove(&entry_key(kind, id)).is_some() {
            self.save(&map)?;
        }
        Ok(())
    }

    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<PendingWrite>> {
        Ok(self.load()?.remove(&entry_key(kind, id)))
    }

    /// Pending writes, oldest first.
    pub fn entries(&self) -> Result<Vec<PendingWrite>> {
        let mut entries: Vec<_> = self.load()?.into_values().collect();
        entries.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.load()?.is_empty())
    }
}
